//! MJPEG HTTP pusher: a decoder owned by a single HTTP request, independent of the WS
//! fanout's shared `CameraDecoder` — each MJPEG client gets its own RTSP source rather than
//! sharing one. Uses `axum::body::Body::from_stream` for the chunked
//! `multipart/x-mixed-replace` response.

use std::sync::Arc;

use axum::body::Body;
use axum::extract::{Path, Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use futures::stream;
use serde::Deserialize;

use super::decoder::{recompress_jpeg, RtspSource, FRAME_POLL};
use super::FanoutState;

#[derive(Debug, Deserialize)]
pub struct MjpegParams {
    pub size: Option<String>,
    pub q: Option<u8>,
}

fn parse_size(spec: &str) -> Option<(u32, u32)> {
    let (w, h) = spec.split_once('x')?;
    Some((w.parse().ok()?, h.parse().ok()?))
}

/// Frame a single JPEG as one `multipart/x-mixed-replace` part: boundary line, headers,
/// blank line, JPEG bytes, trailing CRLF CRLF.
fn format_mjpeg_part(jpeg: &[u8]) -> Vec<u8> {
    let mut part = format!(
        "--jpgboundary\r\nContent-Type: image/jpeg\r\nContent-Length: {}\r\n\r\n",
        jpeg.len()
    )
    .into_bytes();
    part.extend_from_slice(jpeg);
    part.extend_from_slice(b"\r\n\r\n");
    part
}

/// `GET /live/<id>?size=WxH&q=Q`. 404 when `<id>` is not registered; `size` defaults to
/// native, `q` defaults to 0 (no explicit recompress quality).
pub async fn mjpeg_handler(
    Path(id): Path<String>,
    Query(params): Query<MjpegParams>,
    State(state): State<Arc<FanoutState>>,
) -> Response {
    let Some(url) = state.live_url(&id).await else {
        return (StatusCode::NOT_FOUND, "unknown camera id").into_response();
    };

    let resolution = params.size.as_deref().and_then(parse_size).unwrap_or((0, 0));
    let quality = params.q.unwrap_or(0);
    let initial_source = RtspSource::open(&url).await.ok();

    // Reopens on read failure using the `url` captured here rather than any field read back
    // off the source.
    let body_stream = stream::unfold(initial_source, move |source_opt| {
        let url = url.clone();
        async move {
            let mut source = source_opt?;
            let frame = loop {
                tokio::time::sleep(FRAME_POLL).await;
                match source.read_frame().await {
                    Some(frame) => break frame,
                    None => match RtspSource::open(&url).await {
                        Ok(reopened) => {
                            source = reopened;
                            continue;
                        }
                        Err(_) => return None,
                    },
                }
            };
            let jpeg = recompress_jpeg(&frame, resolution, source.native_resolution, quality).unwrap_or(frame);
            let part = format_mjpeg_part(&jpeg);
            Some((Ok::<_, std::io::Error>(Bytes::from(part)), Some(source)))
        }
    });

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "multipart/x-mixed-replace;boundary=--jpgboundary")
        .body(Body::from_stream(body_stream))
        .expect("static response parts")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_wxh_size_param() {
        assert_eq!(parse_size("640x360"), Some((640, 360)));
        assert_eq!(parse_size("garbage"), None);
    }

    #[test]
    fn mjpeg_part_matches_multipart_framing() {
        let jpeg = vec![0xFF, 0xD8, 0x01, 0x02, 0xFF, 0xD9];
        let part = format_mjpeg_part(&jpeg);
        let header = format!("--jpgboundary\r\nContent-Type: image/jpeg\r\nContent-Length: {}\r\n\r\n", jpeg.len());
        assert!(part.starts_with(header.as_bytes()));
        assert!(part.ends_with(b"\r\n\r\n"));
        assert_eq!(&part[header.len()..part.len() - 4], jpeg.as_slice());
    }

    #[tokio::test]
    async fn unknown_live_id_returns_404() {
        let state = Arc::new(FanoutState::new());
        let response = mjpeg_handler(
            Path("missing-cam".to_string()),
            Query(MjpegParams { size: None, q: None }),
            State(state),
        )
        .await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
