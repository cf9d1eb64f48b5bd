//! The single download route: authorization gate plus file streaming.

use axum::body::Body;
use axum::extract::{Request, State};
use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum_extra::extract::cookie::{Cookie, CookieJar};
use pin_project_lite::pin_project;
use std::pin::Pin;
use std::task::{ready, Context, Poll};
use tower::ServiceExt;
use tower_http::services::ServeFile;

use crate::server::session::{Authorization, TransferPermit, SESSION_COOKIE};
use crate::server::{AppState, Terminator};

pub async fn download(
    State(state): State<AppState>,
    jar: CookieJar,
    request: Request,
) -> Response {
    let user_agent = request
        .headers()
        .get(header::USER_AGENT)
        .and_then(|v| v.to_str().ok());
    let cookie = jar.get(SESSION_COOKIE).map(|c| c.value().to_owned());

    let authorization = match state.session.authorize(user_agent, cookie.as_deref()) {
        Ok(authorization) => authorization,
        Err(err) => {
            // No token can ever be issued now, so no request can ever be
            // authorized. End the session.
            tracing::error!("unable to generate session token: {err}");
            state.stop.fire(Terminator::ExternalSignal);
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    };

    match authorization {
        Authorization::SilentIgnore => StatusCode::OK.into_response(),
        Authorization::NotFound => StatusCode::NOT_FOUND.into_response(),
        Authorization::Accept { permit } => serve_content(&state, request, permit).await,
        Authorization::FirstContact { token, permit } => {
            let mut response = serve_content(&state, request, permit).await;
            let cookie = Cookie::new(SESSION_COOKIE, token);
            match HeaderValue::from_str(&cookie.to_string()) {
                Ok(value) => {
                    response.headers_mut().append(header::SET_COOKIE, value);
                }
                Err(err) => {
                    tracing::error!("session cookie not representable as a header: {err}")
                }
            }
            response
        }
    }
}

/// Stream the resolved file as an attachment. The permit rides on the
/// response body so it is released when the stream finishes, the client
/// disconnects, or a write fails.
async fn serve_content(state: &AppState, request: Request, permit: TransferPermit) -> Response {
    let response = match ServeFile::new(state.content.path()).oneshot(request).await {
        Ok(response) => response,
        Err(infallible) => match infallible {},
    };

    let (mut parts, body) = response.into_parts();
    let disposition = format!("attachment; filename=\"{}\"", state.content.name());
    let value = HeaderValue::from_str(&disposition)
        .unwrap_or_else(|_| HeaderValue::from_static("attachment"));
    parts.headers.insert(header::CONTENT_DISPOSITION, value);

    Response::from_parts(
        parts,
        Body::new(PermitBody {
            inner: body,
            permit: Some(permit),
        }),
    )
}

pin_project! {
    /// Response body wrapper holding a transfer permit until the body is
    /// done or dropped mid-stream.
    struct PermitBody<B> {
        #[pin]
        inner: B,
        permit: Option<TransferPermit>,
    }
}

impl<B> http_body::Body for PermitBody<B>
where
    B: http_body::Body,
{
    type Data = B::Data;
    type Error = B::Error;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<http_body::Frame<Self::Data>, Self::Error>>> {
        let this = self.project();
        let frame = ready!(this.inner.poll_frame(cx));
        if frame.is_none() {
            // Finished cleanly; aborted streams release via Drop instead.
            this.permit.take();
        }
        Poll::Ready(frame)
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> http_body::SizeHint {
        self.inner.size_hint()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::content;
    use crate::server::session::Session;
    use crate::server::{routes, StopSignal};
    use std::sync::Arc;
    use tempfile::TempDir;

    #[tokio::test]
    async fn token_generation_failure_is_a_500_that_ends_the_session() {
        let dir = TempDir::new().expect("temp dir");
        let path = dir.path().join("report.pdf");
        std::fs::write(&path, b"fixture bytes").expect("write fixture");

        let state = AppState {
            session: Arc::new(Session::with_failing_generator()),
            content: Arc::new(content::resolve(&[path], false).expect("resolve")),
            stop: StopSignal::new(),
        };
        let app = routes::create_router(&state);

        let request = Request::builder()
            .uri(format!("/{}", state.session.url_path()))
            .header(header::USER_AGENT, "Mozilla/5.0")
            .body(Body::empty())
            .expect("build request");
        let response = app.oneshot(request).await.expect("request");

        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(state.stop.reason(), Some(Terminator::ExternalSignal));
        // no permit was taken, only the phantom unit remains
        assert_eq!(state.session.gauge().in_flight(), 1);
    }
}
