use mockito::{Matcher, Server, ServerGuard};
use serde_json::json;
use std::time::Duration;

use perpbot::api::{BybitClient, ClientSettings, Credentials, Exchange};
use perpbot::models::{OrderRequest, OrderType, Side, TimeInForce};
use perpbot::BotError;

fn client(server: &ServerGuard, credentials: Option<Credentials>) -> BybitClient {
    let settings = ClientSettings {
        base_url: server.url(),
        recv_window_ms: 5000,
        min_request_interval: Duration::ZERO,
        max_retries: 3,
        retry_delay: Duration::from_millis(5),
        timeout: Duration::from_secs(5),
    };
    BybitClient::new(settings, credentials).unwrap()
}

fn envelope(code: i64, msg: &str, result: serde_json::Value) -> String {
    json!({ "retCode": code, "retMsg": msg, "result": result, "time": 1700000000000i64 }).to_string()
}

#[tokio::test]
async fn test_latest_price() {
    let mut server = Server::new_async().await;
    let mock = server
        .mock("GET", "/v5/market/tickers")
        .match_query(Matcher::AllOf(vec![
            Matcher::UrlEncoded("category".into(), "linear".into()),
            Matcher::UrlEncoded("symbol".into(), "BTCUSDT".into()),
        ]))
        .with_body(envelope(0, "OK", json!({ "list": [{ "symbol": "BTCUSDT", "lastPrice": "30123.5" }] })))
        .create_async()
        .await;

    let price = client(&server, None).latest_price("BTCUSDT").await.unwrap();
    assert_eq!(price, 30123.5);
    mock.assert_async().await;
}

#[tokio::test]
async fn test_rate_limit_code_retried_until_exhausted() {
    let mut server = Server::new_async().await;
    let mock = server
        .mock("GET", "/v5/market/tickers")
        .match_query(Matcher::Any)
        .with_body(envelope(10006, "Too many visits!", json!({})))
        .expect(3)
        .create_async()
        .await;

    let err = client(&server, None).latest_price("BTCUSDT").await.unwrap_err();
    assert_eq!(err, BotError::RateLimited { attempts: 3 });
    mock.assert_async().await;
}

#[tokio::test]
async fn test_business_rejection_not_retried() {
    let mut server = Server::new_async().await;
    let mock = server
        .mock("GET", "/v5/market/tickers")
        .match_query(Matcher::Any)
        .with_body(envelope(10001, "params error: symbol invalid", json!({})))
        .expect(1)
        .create_async()
        .await;

    let err = client(&server, None).latest_price("NOPEUSDT").await.unwrap_err();
    assert_eq!(
        err,
        BotError::ExchangeRejected {
            code: 10001,
            message: "params error: symbol invalid".to_string()
        }
    );
    mock.assert_async().await;
}

#[tokio::test]
async fn test_http_errors_classified() {
    let mut server = Server::new_async().await;
    let server_error = server
        .mock("GET", "/v5/market/tickers")
        .match_query(Matcher::Any)
        .with_status(502)
        .expect(3)
        .create_async()
        .await;

    let err = client(&server, None).latest_price("BTCUSDT").await.unwrap_err();
    assert!(matches!(err, BotError::TransientNetwork { attempts: 3, .. }), "{:?}", err);
    server_error.assert_async().await;

    let mut server = Server::new_async().await;
    let too_many = server
        .mock("GET", "/v5/market/orderbook")
        .match_query(Matcher::Any)
        .with_status(429)
        .expect(3)
        .create_async()
        .await;

    let err = client(&server, None).order_book("BTCUSDT", 10).await.unwrap_err();
    assert_eq!(err, BotError::RateLimited { attempts: 3 });
    too_many.assert_async().await;

    let mut server = Server::new_async().await;
    let forbidden = server
        .mock("GET", "/v5/market/orderbook")
        .match_query(Matcher::Any)
        .with_status(403)
        .with_body("forbidden")
        .expect(1)
        .create_async()
        .await;

    let err = client(&server, None).order_book("BTCUSDT", 10).await.unwrap_err();
    assert!(matches!(err, BotError::ExchangeRejected { code: 403, .. }));
    forbidden.assert_async().await;
}

#[tokio::test]
async fn test_signed_request_headers() {
    let mut server = Server::new_async().await;
    let mock = server
        .mock("GET", "/v5/account/wallet-balance")
        .match_query(Matcher::UrlEncoded("accountType".into(), "UNIFIED".into()))
        .match_header("X-BAPI-API-KEY", "test-key")
        .match_header("X-BAPI-RECV-WINDOW", "5000")
        .match_header("X-BAPI-TIMESTAMP", Matcher::Regex(r"^\d{13}$".to_string()))
        .match_header("X-BAPI-SIGN", Matcher::Regex(r"^[0-9a-f]{64}$".to_string()))
        .with_body(envelope(
            0,
            "OK",
            json!({ "list": [{
                "accountType": "UNIFIED",
                "totalEquity": "1050.5",
                "totalAvailableBalance": "1000",
                "totalInitialMargin": "50.5"
            }] }),
        ))
        .create_async()
        .await;

    let account = client(&server, Some(Credentials::new("test-key", "test-secret")))
        .wallet_balance("UNIFIED")
        .await
        .unwrap();

    assert_eq!(account.available_balance, 1000.0);
    assert_eq!(account.equity, 1050.5);
    assert_eq!(account.used_margin, 50.5);
    mock.assert_async().await;
}

#[tokio::test]
async fn test_signed_call_without_credentials_never_sent() {
    let mut server = Server::new_async().await;
    let mock = server
        .mock("GET", "/v5/position/list")
        .match_query(Matcher::Any)
        .expect(0)
        .create_async()
        .await;

    let err = client(&server, None).positions("BTCUSDT").await.unwrap_err();
    assert!(matches!(err, BotError::Configuration(_)));
    mock.assert_async().await;
}

#[tokio::test]
async fn test_leverage_not_modified_is_success() {
    let mut server = Server::new_async().await;
    let mock = server
        .mock("POST", "/v5/position/set-leverage")
        .match_body(Matcher::PartialJson(json!({
            "category": "linear",
            "symbol": "BTCUSDT",
            "buyLeverage": "3",
            "sellLeverage": "3"
        })))
        .with_body(envelope(110043, "leverage not modified", json!({})))
        .create_async()
        .await;

    let client = client(&server, Some(Credentials::new("k", "s")));
    tokio_test::assert_ok!(client.set_leverage("BTCUSDT", 3, 3).await);
    mock.assert_async().await;
}

#[tokio::test]
async fn test_place_order_body() {
    let mut server = Server::new_async().await;
    let mock = server
        .mock("POST", "/v5/order/create")
        .match_header("Content-Type", "application/json")
        .match_body(Matcher::PartialJson(json!({
            "category": "linear",
            "symbol": "BTCUSDT",
            "side": "Buy",
            "orderType": "Limit",
            "qty": "0.3",
            "price": "30000.1",
            "timeInForce": "PostOnly",
            "reduceOnly": false,
            "orderLinkId": "pb-entry-1",
            "positionIdx": 0
        })))
        .with_body(envelope(0, "OK", json!({ "orderId": "abc-123", "orderLinkId": "pb-entry-1" })))
        .create_async()
        .await;

    let request = OrderRequest {
        symbol: "BTCUSDT".to_string(),
        side: Side::Buy,
        order_type: OrderType::Limit,
        // Float noise must not reach the venue
        qty: 0.1 + 0.2,
        price: Some(30_000.1),
        time_in_force: TimeInForce::PostOnly,
        reduce_only: false,
        order_link_id: "pb-entry-1".to_string(),
    };

    let ack = client(&server, Some(Credentials::new("k", "s")))
        .place_order(&request)
        .await
        .unwrap();
    assert_eq!(ack.order_id, "abc-123");
    mock.assert_async().await;
}

#[tokio::test]
async fn test_candles_returned_oldest_first() {
    let mut server = Server::new_async().await;
    server
        .mock("GET", "/v5/market/kline")
        .match_query(Matcher::UrlEncoded("interval".into(), "5".into()))
        .with_body(envelope(
            0,
            "OK",
            json!({ "symbol": "BTCUSDT", "category": "linear", "list": [
                ["1700000600000", "102", "103", "101", "102.5", "12", "1230"],
                ["1700000300000", "101", "102", "100", "102", "10", "1015"],
                ["1700000000000", "100", "101", "99", "101", "8", "800"]
            ] }),
        ))
        .create_async()
        .await;

    let candles = client(&server, None).candles("BTCUSDT", "5", 3).await.unwrap();

    let closes: Vec<f64> = candles.iter().map(|c| c.close).collect();
    assert_eq!(closes, vec![101.0, 102.0, 102.5]);
    assert!(candles[0].timestamp < candles[2].timestamp);
}

#[tokio::test]
async fn test_order_detail_falls_back_to_history() {
    let mut server = Server::new_async().await;
    let realtime = server
        .mock("GET", "/v5/order/realtime")
        .match_query(Matcher::UrlEncoded("orderId".into(), "abc-123".into()))
        .with_body(envelope(0, "OK", json!({ "list": [] })))
        .create_async()
        .await;
    let history = server
        .mock("GET", "/v5/order/history")
        .match_query(Matcher::UrlEncoded("orderId".into(), "abc-123".into()))
        .with_body(envelope(
            0,
            "OK",
            json!({ "list": [{
                "orderId": "abc-123",
                "side": "Sell",
                "qty": "0.2",
                "price": "0",
                "avgPrice": "29950.5",
                "cumExecQty": "0.2",
                "orderStatus": "Filled"
            }] }),
        ))
        .create_async()
        .await;

    let detail = client(&server, Some(Credentials::new("k", "s")))
        .order_detail("BTCUSDT", "abc-123")
        .await
        .unwrap();

    assert_eq!(detail.side, Side::Sell);
    assert_eq!(detail.avg_price, 29950.5);
    assert!(!detail.status.is_dead());
    realtime.assert_async().await;
    history.assert_async().await;
}
