use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use axum::{
    body::{Body, Bytes},
    extract::State,
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use futures_util::StreamExt;
use tokio::time::Instant;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use shaire_core::domain::message::ChatRequest;
use shaire_core::llm::{openai::OpenAiClient, ChatInput, CompletionClient};
use shaire_core::market::StockAnalyzer;
use shaire_core::prompt;

const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;

const GENERIC_ERROR: &str = "There was an error processing your request";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let settings = shaire_core::config::Settings::from_env()?;
    let _sentry_guard = init_sentry(&settings);

    tracing_subscriber::registry()
        .with(EnvFilter::from_default_env())
        .with(tracing_subscriber::fmt::layer())
        .with(sentry_tracing::layer())
        .init();

    let llm: Option<Arc<dyn CompletionClient>> = match OpenAiClient::from_settings(&settings) {
        Ok(client) => Some(Arc::new(client)),
        Err(e) => {
            sentry_anyhow::capture_anyhow(&e);
            tracing::error!(error = %e, "LLM client unavailable; starting API in degraded mode");
            None
        }
    };

    let stream_timeout_secs = std::env::var("REQUEST_TIMEOUT_SECS")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(DEFAULT_REQUEST_TIMEOUT_SECS);

    let state = AppState {
        analyzer: Arc::new(StockAnalyzer::from_env()),
        llm,
        stream_timeout: Duration::from_secs(stream_timeout_secs),
    };

    let app = router(state);

    let port: u16 = std::env::var("PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(3000);
    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], port));

    tracing::info!(%addr, "api listening");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

async fn healthz() -> &'static str {
    "ok"
}

#[derive(Clone)]
struct AppState {
    analyzer: Arc<StockAnalyzer>,
    llm: Option<Arc<dyn CompletionClient>>,
    stream_timeout: Duration,
}

fn router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/api/chat", post(post_chat))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}

// The body is parsed by hand: a malformed payload must produce the generic
// 500 contract, not the Json extractor's 400.
async fn post_chat(State(state): State<AppState>, body: Bytes) -> Response {
    match handle_chat(state, body).await {
        Ok(res) => res,
        Err(e) => {
            sentry_anyhow::capture_anyhow(&e);
            tracing::error!(error = %e, "chat request failed");
            error_response()
        }
    }
}

async fn handle_chat(state: AppState, body: Bytes) -> anyhow::Result<Response> {
    let req: ChatRequest = serde_json::from_slice(&body).context("invalid request body")?;

    let deadline = Instant::now() + state.stream_timeout;

    let llm = state
        .llm
        .as_ref()
        .context("no completion client configured")?;

    // Augmentation (with its simulated quote latency) and stream initiation
    // share the request deadline; failures here short-circuit to the generic
    // error before any byte of the response body is written.
    let mut stream = tokio::time::timeout_at(deadline, async {
        let system = prompt::augment(&req.messages, &state.analyzer).await;
        llm.stream_chat(ChatInput {
            system,
            messages: req.messages,
        })
        .await
    })
    .await
    .context("timed out before streaming started")??;

    let (tx, rx) = tokio::sync::mpsc::unbounded_channel::<Result<Bytes, Infallible>>();

    tokio::spawn(async move {
        loop {
            tokio::select! {
                chunk = stream.next() => match chunk {
                    Some(Ok(text)) => {
                        // A closed receiver means the client disconnected;
                        // dropping the stream releases the provider request.
                        if tx.send(Ok(Bytes::from(text))).is_err() {
                            break;
                        }
                    }
                    Some(Err(e)) => {
                        sentry_anyhow::capture_anyhow(&e);
                        tracing::error!(error = %e, "provider stream failed mid-response");
                        break;
                    }
                    None => break,
                },
                _ = tokio::time::sleep_until(deadline) => {
                    tracing::warn!("request deadline reached; terminating stream");
                    break;
                }
            }
        }
    });

    let mut res = Response::new(Body::from_stream(UnboundedReceiverStream::new(rx)));
    res.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    Ok(res)
}

fn error_response() -> Response {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(serde_json::json!({ "error": GENERIC_ERROR })),
    )
        .into_response()
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}

fn init_sentry(settings: &shaire_core::config::Settings) -> Option<sentry::ClientInitGuard> {
    let dsn = settings.sentry_dsn.as_deref()?;
    Some(sentry::init((
        dsn,
        sentry::ClientOptions {
            release: sentry::release_name!(),
            ..Default::default()
        },
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use shaire_core::llm::{Provider, TokenStream};
    use shaire_core::market::StockDataset;
    use std::sync::Mutex;
    use tower::ServiceExt;

    /// Replays canned chunks and records the input it was given.
    struct ScriptedClient {
        chunks: Vec<&'static str>,
        seen: Arc<Mutex<Option<ChatInput>>>,
    }

    impl ScriptedClient {
        fn new(chunks: Vec<&'static str>) -> (Self, Arc<Mutex<Option<ChatInput>>>) {
            let seen = Arc::new(Mutex::new(None));
            (
                Self {
                    chunks,
                    seen: seen.clone(),
                },
                seen,
            )
        }
    }

    #[async_trait::async_trait]
    impl CompletionClient for ScriptedClient {
        fn provider(&self) -> Provider {
            Provider::OpenAi
        }

        async fn stream_chat(&self, input: ChatInput) -> anyhow::Result<TokenStream> {
            *self.seen.lock().unwrap() = Some(input);
            let chunks: Vec<anyhow::Result<String>> =
                self.chunks.iter().map(|c| Ok(c.to_string())).collect();
            Ok(Box::pin(futures_util::stream::iter(chunks)))
        }
    }

    /// Never yields; used to exercise the stream deadline.
    struct StalledClient;

    #[async_trait::async_trait]
    impl CompletionClient for StalledClient {
        fn provider(&self) -> Provider {
            Provider::OpenAi
        }

        async fn stream_chat(&self, _input: ChatInput) -> anyhow::Result<TokenStream> {
            Ok(Box::pin(futures_util::stream::pending()))
        }
    }

    fn state_with(llm: Option<Arc<dyn CompletionClient>>, timeout: Duration) -> AppState {
        AppState {
            analyzer: Arc::new(StockAnalyzer::new(StockDataset::builtin(), Duration::ZERO)),
            llm,
            stream_timeout: timeout,
        }
    }

    fn chat_post(body: &str) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri("/api/chat")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn body_string(res: Response) -> String {
        let bytes = res.into_body().collect().await.unwrap().to_bytes();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn healthz_responds_ok() {
        let (client, _) = ScriptedClient::new(vec![]);
        let app = router(state_with(Some(Arc::new(client)), Duration::from_secs(30)));
        let res = app
            .oneshot(Request::builder().uri("/healthz").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::OK);
        assert_eq!(body_string(res).await, "ok");
    }

    #[tokio::test]
    async fn malformed_body_returns_generic_500() {
        let (client, _) = ScriptedClient::new(vec!["unused"]);
        let app = router(state_with(Some(Arc::new(client)), Duration::from_secs(30)));
        let res = app.oneshot(chat_post("{not json")).await.unwrap();
        assert_eq!(res.status(), StatusCode::INTERNAL_SERVER_ERROR);

        let body: serde_json::Value = serde_json::from_str(&body_string(res).await).unwrap();
        assert_eq!(body, serde_json::json!({ "error": GENERIC_ERROR }));
    }

    #[tokio::test]
    async fn missing_client_returns_generic_500() {
        let app = router(state_with(None, Duration::from_secs(30)));
        let res = app
            .oneshot(chat_post(r#"{"messages":[{"role":"user","content":"hi"}]}"#))
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::INTERNAL_SERVER_ERROR);

        let body: serde_json::Value = serde_json::from_str(&body_string(res).await).unwrap();
        assert_eq!(body["error"], GENERIC_ERROR);
    }

    #[tokio::test]
    async fn streams_provider_chunks_in_order() {
        let (client, _) = ScriptedClient::new(vec!["AAPL ", "looks ", "strong."]);
        let app = router(state_with(Some(Arc::new(client)), Duration::from_secs(30)));
        let res = app
            .oneshot(chat_post(
                r#"{"messages":[{"role":"user","content":"Analyze AAPL stock"}]}"#,
            ))
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::OK);
        assert_eq!(
            res.headers()[header::CONTENT_TYPE],
            "text/plain; charset=utf-8"
        );
        assert_eq!(body_string(res).await, "AAPL looks strong.");
    }

    #[tokio::test]
    async fn system_prompt_carries_stock_data() {
        let (client, seen) = ScriptedClient::new(vec!["ok"]);
        let app = router(state_with(Some(Arc::new(client)), Duration::from_secs(30)));
        let res = app
            .oneshot(chat_post(
                r#"{"messages":[{"role":"user","content":"Analyze AAPL stock"}]}"#,
            ))
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::OK);
        let _ = body_string(res).await;

        let input = seen.lock().unwrap().take().expect("client was invoked");
        assert!(input.system.contains("Current Price: $187.32"));
        assert!(input.system.contains("Recommendation: Buy"));
        assert_eq!(input.messages.len(), 1);
    }

    #[tokio::test]
    async fn stalled_stream_is_cut_off_at_the_deadline() {
        let app = router(state_with(
            Some(Arc::new(StalledClient)),
            Duration::from_millis(50),
        ));
        let res = app
            .oneshot(chat_post(r#"{"messages":[{"role":"user","content":"hi"}]}"#))
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::OK);
        // The deadline closes the body instead of letting it hang.
        assert_eq!(body_string(res).await, "");
    }
}
