use super::crypto::WecomCrypto;
use super::xml::{extract_encrypt, parse_text_message};
use crate::types::InboundMessage;
use axum::Router;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::routing::get;
use serde::Deserialize;
use std::sync::Arc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{RwLock, mpsc};

pub(crate) struct CallbackState {
    crypto: WecomCrypto,
    account_id: String,
    inbound_tx: RwLock<Option<mpsc::Sender<InboundMessage>>>,
}

impl CallbackState {
    pub(crate) fn new(crypto: WecomCrypto, account_id: String) -> Self {
        Self {
            crypto,
            account_id,
            inbound_tx: RwLock::new(None),
        }
    }

    pub(crate) async fn attach(&self, tx: mpsc::Sender<InboundMessage>) {
        *self.inbound_tx.write().await = Some(tx);
    }
}

#[derive(Debug, Default, Deserialize)]
struct CallbackQuery {
    #[serde(default)]
    msg_signature: String,
    #[serde(default)]
    timestamp: String,
    #[serde(default)]
    nonce: String,
    #[serde(default)]
    echostr: String,
}

pub(crate) fn router(state: Arc<CallbackState>) -> Router {
    Router::new()
        .route("/wecom/callback", get(verify_url).post(receive_message))
        .with_state(state)
}

/// URL verification: answer the decrypted `echostr`.
async fn verify_url(
    State(state): State<Arc<CallbackState>>,
    Query(query): Query<CallbackQuery>,
) -> (StatusCode, String) {
    if !state.crypto.verify_signature(
        &query.msg_signature,
        &query.timestamp,
        &query.nonce,
        &query.echostr,
    ) {
        tracing::warn!("wecom url verification signature mismatch");
        return (StatusCode::FORBIDDEN, "Invalid signature".to_string());
    }
    match state.crypto.decrypt(&query.echostr) {
        Ok(echo) => {
            tracing::info!("wecom url verified");
            (StatusCode::OK, echo)
        }
        Err(e) => {
            tracing::warn!(%e, "wecom echostr decrypt failed");
            (StatusCode::BAD_REQUEST, "Invalid echostr".to_string())
        }
    }
}

#[tracing::instrument(level = "debug", skip_all)]
async fn receive_message(
    State(state): State<Arc<CallbackState>>,
    Query(query): Query<CallbackQuery>,
    body: String,
) -> (StatusCode, &'static str) {
    let encrypt = match extract_encrypt(&body) {
        Ok(Some(encrypt)) => encrypt,
        Ok(None) => {
            tracing::warn!("wecom callback missing Encrypt");
            return (StatusCode::BAD_REQUEST, "Missing Encrypt");
        }
        Err(e) => {
            tracing::warn!(%e, "wecom callback body is not valid xml");
            return (StatusCode::BAD_REQUEST, "Invalid XML");
        }
    };

    if !state
        .crypto
        .verify_signature(&query.msg_signature, &query.timestamp, &query.nonce, &encrypt)
    {
        tracing::warn!("wecom callback signature mismatch");
        return (StatusCode::FORBIDDEN, "Invalid signature");
    }

    let plain = match state.crypto.decrypt(&encrypt) {
        Ok(plain) => plain,
        Err(e) => {
            tracing::warn!(%e, "wecom callback decrypt failed");
            return (StatusCode::BAD_REQUEST, "Decrypt failed");
        }
    };

    match parse_text_message(&plain) {
        Ok(Some(message)) => {
            tracing::info!(from_user = %message.from_user, "wecom message received");
            let inbound = message.into_inbound(&state.account_id);
            let tx = state.inbound_tx.read().await.clone();
            match tx {
                // WeCom expects an answer within 5s, so a full queue drops the message.
                Some(tx) => match tx.try_send(inbound) {
                    Ok(()) => {}
                    Err(TrySendError::Full(dropped)) => tracing::error!(
                        message_id = %dropped.message_id,
                        "wecom inbound queue full; message dropped"
                    ),
                    Err(TrySendError::Closed(_)) => {
                        tracing::error!("wecom inbound queue closed")
                    }
                },
                None => tracing::error!("wecom adapter started without inbound queue"),
            }
        }
        Ok(None) => tracing::debug!("wecom non-text callback ignored"),
        Err(e) => tracing::warn!(%e, "wecom decrypted message unreadable"),
    }

    (StatusCode::OK, "")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wecom::crypto::tests::test_crypto;
    use axum::body::{Body, to_bytes};
    use axum::http::Request;
    use std::time::Duration;
    use tower::util::ServiceExt;

    const MESSAGE_XML: &str = "<xml><ToUserName><![CDATA[corp123]]></ToUserName><FromUserName><![CDATA[zhangsan]]></FromUserName><CreateTime>1710000000</CreateTime><MsgType><![CDATA[text]]></MsgType><Content><![CDATA[在吗]]></Content><MsgId>7001</MsgId><AgentID>1000002</AgentID></xml>";

    async fn attached_state() -> (Arc<CallbackState>, mpsc::Receiver<InboundMessage>) {
        let state = Arc::new(CallbackState::new(test_crypto(), "default".to_string()));
        let (tx, rx) = mpsc::channel(8);
        state.attach(tx).await;
        (state, rx)
    }

    fn post(uri: String, body: String) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .body(Body::from(body))
            .expect("request")
    }

    fn envelope(encrypt: &str) -> String {
        format!("<xml><ToUserName><![CDATA[corp123]]></ToUserName><Encrypt><![CDATA[{encrypt}]]></Encrypt></xml>")
    }

    #[tokio::test]
    async fn valid_message_is_forwarded() {
        let (state, mut rx) = attached_state().await;
        let crypto = test_crypto();
        let encrypt = crypto.encrypt(MESSAGE_XML).expect("encrypt");
        let signature = crypto.signature("1710000000", "n1", &encrypt);

        let response = router(state)
            .oneshot(post(
                format!("/wecom/callback?msg_signature={signature}&timestamp=1710000000&nonce=n1"),
                envelope(&encrypt),
            ))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::OK);

        let inbound = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("forwarded in time")
            .expect("inbound message");
        assert_eq!(inbound.content, "在吗");
        assert_eq!(inbound.sender_id.as_str(), "zhangsan");
        assert_eq!(inbound.message_id.as_str(), "7001");
    }

    fn signed_post(crypto: &WecomCrypto, xml: &str) -> Request<Body> {
        let encrypt = crypto.encrypt(xml).expect("encrypt");
        let signature = crypto.signature("1710000000", "n1", &encrypt);
        post(
            format!("/wecom/callback?msg_signature={signature}&timestamp=1710000000&nonce=n1"),
            envelope(&encrypt),
        )
    }

    fn text_xml(msg_id: usize) -> String {
        MESSAGE_XML
            .replace("在吗", &format!("msg {msg_id}"))
            .replace("7001", &msg_id.to_string())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn acked_messages_arrive_in_ack_order() {
        let state = Arc::new(CallbackState::new(test_crypto(), "default".to_string()));
        let (tx, mut rx) = mpsc::channel(128);
        state.attach(tx).await;
        let crypto = test_crypto();

        for i in 0..100 {
            let response = router(state.clone())
                .oneshot(signed_post(&crypto, &text_xml(i)))
                .await
                .expect("response");
            assert_eq!(response.status(), StatusCode::OK);
        }

        let mut ids = Vec::new();
        while let Ok(message) = rx.try_recv() {
            ids.push(message.message_id.as_str().to_string());
        }
        let expected: Vec<String> = (0..100).map(|i| i.to_string()).collect();
        assert_eq!(ids, expected);
    }

    #[tokio::test]
    async fn full_queue_still_acks_without_blocking() {
        let state = Arc::new(CallbackState::new(test_crypto(), "default".to_string()));
        let (tx, mut rx) = mpsc::channel(1);
        state.attach(tx).await;
        let crypto = test_crypto();

        for i in 0..3 {
            let response = tokio::time::timeout(
                Duration::from_secs(1),
                router(state.clone()).oneshot(signed_post(&crypto, &text_xml(i))),
            )
            .await
            .expect("acked in time")
            .expect("response");
            assert_eq!(response.status(), StatusCode::OK);
        }

        let first = rx.try_recv().expect("first message queued");
        assert_eq!(first.message_id.as_str(), "0");
        assert!(rx.try_recv().is_err(), "overflow was dropped");
    }

    #[tokio::test]
    async fn bad_signature_is_forbidden() {
        let (state, mut rx) = attached_state().await;
        let encrypt = test_crypto().encrypt(MESSAGE_XML).expect("encrypt");

        let response = router(state)
            .oneshot(post(
                "/wecom/callback?msg_signature=deadbeef&timestamp=1&nonce=n".to_string(),
                envelope(&encrypt),
            ))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        assert!(rx.try_recv().is_err(), "nothing reaches the queue");
    }

    #[tokio::test]
    async fn missing_encrypt_is_bad_request() {
        let (state, _rx) = attached_state().await;
        let response = router(state)
            .oneshot(post(
                "/wecom/callback?msg_signature=x&timestamp=1&nonce=n".to_string(),
                "<xml><ToUserName>corp123</ToUserName></xml>".to_string(),
            ))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn undecryptable_payload_is_bad_request() {
        let (state, mut rx) = attached_state().await;
        let crypto = test_crypto();
        let garbage = "AAAAAAAAAAAAAAAAAAAAAA==";
        let signature = crypto.signature("1", "n", garbage);

        let response = router(state)
            .oneshot(post(
                format!("/wecom/callback?msg_signature={signature}&timestamp=1&nonce=n"),
                envelope(garbage),
            ))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn url_verification_echoes_plaintext() {
        let (state, _rx) = attached_state().await;
        let crypto = test_crypto();
        let echostr = crypto.encrypt("echo-123").expect("encrypt");
        let signature = crypto.signature("1", "n", &echostr);
        let query = format!(
            "/wecom/callback?msg_signature={signature}&timestamp=1&nonce=n&echostr={}",
            urlencode(&echostr)
        );

        let response = router(state)
            .oneshot(
                Request::builder()
                    .uri(query)
                    .body(Body::empty())
                    .expect("request"),
            )
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::OK);
        let body = to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("body");
        assert_eq!(&body[..], b"echo-123");
    }

    fn urlencode(raw: &str) -> String {
        raw.chars()
            .map(|c| match c {
                '+' => "%2B".to_string(),
                '/' => "%2F".to_string(),
                '=' => "%3D".to_string(),
                other => other.to_string(),
            })
            .collect()
    }
}
