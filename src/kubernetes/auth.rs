//! Per-request bearer authentication
//!
//! Puts a [`TokenProvider`] on the client's request path so every API
//! round-trip (including websocket upgrades for port-forwards) carries a
//! freshly minted token instead of one captured at connect time.

use std::sync::Arc;
use std::task::{Context, Poll};

use futures::future::BoxFuture;
use http::header::{HeaderValue, AUTHORIZATION};
use http::Request;
use tokio::sync::Mutex;
use tower::{BoxError, Layer, Service, ServiceExt};

use super::token::TokenProvider;

/// Layer that authenticates each request with a fresh token
#[derive(Debug, Clone)]
pub struct TokenAuthLayer {
    provider: TokenProvider,
}

impl TokenAuthLayer {
    pub fn new(provider: TokenProvider) -> Self {
        Self { provider }
    }
}

impl<S> Layer<S> for TokenAuthLayer {
    type Service = TokenAuth<S>;

    fn layer(&self, inner: S) -> Self::Service {
        TokenAuth {
            inner: Arc::new(Mutex::new(inner)),
            provider: self.provider.clone(),
        }
    }
}

/// Service produced by [`TokenAuthLayer`].
///
/// The inner stack is shared behind a lock that is held only while a request
/// is dispatched, never while its response is awaited.
pub struct TokenAuth<S> {
    inner: Arc<Mutex<S>>,
    provider: TokenProvider,
}

impl<S> Clone for TokenAuth<S> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            provider: self.provider.clone(),
        }
    }
}

impl<S, B> Service<Request<B>> for TokenAuth<S>
where
    S: Service<Request<B>> + Send + 'static,
    S::Response: Send + 'static,
    S::Future: Send + 'static,
    S::Error: Into<BoxError>,
    B: Send + 'static,
{
    type Response = S::Response;
    type Error = BoxError;
    type Future = BoxFuture<'static, Result<S::Response, BoxError>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        // Inner readiness is awaited per call, after the token is minted
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, mut request: Request<B>) -> Self::Future {
        let inner = self.inner.clone();
        let provider = self.provider.clone();

        Box::pin(async move {
            let token = provider.get_token().await?;
            let mut value = HeaderValue::try_from(format!("Bearer {}", token.as_str()))?;
            value.set_sensitive(true);
            request.headers_mut().insert(AUTHORIZATION, value);

            let response = {
                let mut guard = inner.lock().await;
                let service = &mut *guard;
                service.ready().await.map_err(Into::<BoxError>::into)?;
                service.call(request)
            };
            response.await.map_err(Into::into)
        })
    }
}
