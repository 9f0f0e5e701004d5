//! RTSP source handling and the WS fanout `CameraDecoder`. No native RTSP/demux binding is
//! in this crate's dependency stack, so `ffmpeg` is spawned as a child process and asked to
//! remux straight to an MJPEG byte stream (`-f image2pipe -vcodec mjpeg -`); frames are
//! split on JFIF SOI/EOI markers from its stdout.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::Message;
use base64::prelude::*;
use image::imageops::FilterType;
use image::ImageFormat;
use regex::Regex;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, warn};

const SOI: [u8; 2] = [0xFF, 0xD8];
const EOI: [u8; 2] = [0xFF, 0xD9];
const CHUNK_SIZE: usize = 32 * 1024;
pub const FRAME_POLL: Duration = Duration::from_millis(50);

/// A single ffmpeg subprocess remuxing one RTSP URL to an MJPEG byte stream. Shared by the
/// WS `CameraDecoder` loop below and the per-request MJPEG pusher — neither owns the
/// other, each opens its own `RtspSource`.
pub struct RtspSource {
    child: Child,
    reader: BufReader<tokio::process::ChildStdout>,
    buffer: Vec<u8>,
    pub native_resolution: (u32, u32),
    pub fps: f32,
}

impl RtspSource {
    pub async fn open(url: &str) -> std::io::Result<Self> {
        let mut child = Command::new("ffmpeg")
            .args(["-rtsp_transport", "tcp", "-i", url, "-f", "image2pipe", "-vcodec", "mjpeg", "-"])
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;
        let stdout = child.stdout.take().expect("ffmpeg spawned with piped stdout");
        let stderr = child.stderr.take().expect("ffmpeg spawned with piped stderr");
        let (native_resolution, fps) = read_stream_banner(stderr).await;
        Ok(Self {
            child,
            reader: BufReader::new(stdout),
            buffer: Vec::new(),
            native_resolution,
            fps,
        })
    }

    /// Read stdout until a full JPEG frame (SOI..EOI) has accumulated. `None` on EOF or a
    /// read error — the caller reopens the source.
    pub async fn read_frame(&mut self) -> Option<Vec<u8>> {
        let mut chunk = [0u8; 4096];
        loop {
            if let Some(frame) = extract_frame(&mut self.buffer) {
                return Some(frame);
            }
            match self.reader.read(&mut chunk).await {
                Ok(0) => return None,
                Ok(n) => self.buffer.extend_from_slice(&chunk[..n]),
                Err(err) => {
                    debug!(error = %err, "ffmpeg stdout read error");
                    return None;
                }
            }
        }
    }
}

impl Drop for RtspSource {
    fn drop(&mut self) {
        let _ = self.child.start_kill();
    }
}

fn extract_frame(buffer: &mut Vec<u8>) -> Option<Vec<u8>> {
    let start = find(buffer, &SOI)?;
    let end = find(&buffer[start + 2..], &EOI).map(|i| start + 2 + i + 2)?;
    let frame = buffer[start..end].to_vec();
    buffer.drain(..end);
    Some(frame)
}

fn find(haystack: &[u8], needle: &[u8; 2]) -> Option<usize> {
    haystack.windows(2).position(|w| w == needle)
}

/// Read `native_resolution`/`fps` from ffmpeg's stderr banner (`Stream #0:0: Video: ...,
/// WxH, N fps`). Remaining stderr output is drained in the background so ffmpeg never
/// blocks on a full pipe.
async fn read_stream_banner(stderr: tokio::process::ChildStderr) -> ((u32, u32), f32) {
    let re = Regex::new(r"(\d{2,5})x(\d{2,5}).*?(\d+(?:\.\d+)?) fps").expect("static regex");
    let mut reader = BufReader::new(stderr);
    let mut line = String::new();
    let mut result = ((0, 0), 0.0);
    for _ in 0..40 {
        line.clear();
        match reader.read_line(&mut line).await {
            Ok(0) => break,
            Ok(_) => {
                if let Some(caps) = re.captures(&line) {
                    let w = caps[1].parse().unwrap_or(0);
                    let h = caps[2].parse().unwrap_or(0);
                    let fps = caps[3].parse().unwrap_or(0.0);
                    result = ((w, h), fps);
                    break;
                }
            }
            Err(_) => break,
        }
    }
    tokio::spawn(async move {
        let mut discard = String::new();
        while reader.read_line(&mut discard).await.unwrap_or(0) > 0 {
            discard.clear();
        }
    });
    result
}

/// Resize (if `requested` differs from `(0,0)` and from `native`) and JPEG-recompress a raw
/// frame. A `quality` of 0 means "no recompress": the frame is kept byte-for-byte when no
/// resize is needed either. Any other quality always re-encodes, even at native resolution.
pub fn recompress_jpeg(frame: &[u8], requested: (u32, u32), native: (u32, u32), quality: u8) -> Option<Vec<u8>> {
    let no_resize = requested == (0, 0) || requested == native;
    if quality == 0 && no_resize {
        return Some(frame.to_vec());
    }
    let img = image::load_from_memory_with_format(frame, ImageFormat::Jpeg).ok()?;
    let target = if no_resize { native } else { requested };
    let resized = img.resize_exact(target.0.max(1), target.1.max(1), FilterType::Triangle);
    let mut out = Vec::new();
    let mut cursor = std::io::Cursor::new(&mut out);
    let encoder = image::codecs::jpeg::JpegEncoder::new_with_quality(&mut cursor, if quality == 0 { 85 } else { quality });
    resized.write_with_encoder(encoder).ok()?;
    Some(out)
}

#[derive(Clone)]
pub struct ViewerHandle {
    pub id: u64,
    pub resolution: (u32, u32),
    pub quality: u8,
    pub sender: mpsc::UnboundedSender<Message>,
}

/// One decoder per RTSP URL, shared by every WS viewer attached to it: at most one
/// `CameraDecoder` ever exists for a given `url`.
pub struct CameraDecoder {
    pub url: String,
    viewers: Mutex<HashMap<u64, ViewerHandle>>,
    stop: Arc<AtomicBool>,
    native_resolution: Mutex<(u32, u32)>,
}

impl CameraDecoder {
    pub fn spawn(url: String) -> Arc<Self> {
        let decoder = Arc::new(Self {
            url,
            viewers: Mutex::new(HashMap::new()),
            stop: Arc::new(AtomicBool::new(false)),
            native_resolution: Mutex::new((0, 0)),
        });
        let task_decoder = Arc::clone(&decoder);
        tokio::spawn(async move { task_decoder.run().await });
        decoder
    }

    pub async fn attach(&self, viewer: ViewerHandle) {
        self.viewers.lock().await.insert(viewer.id, viewer);
    }

    pub async fn detach(&self, id: u64) {
        self.viewers.lock().await.remove(&id);
    }

    pub async fn resize(&self, id: u64, resolution: (u32, u32)) {
        if let Some(v) = self.viewers.lock().await.get_mut(&id) {
            v.resolution = resolution;
        }
    }

    pub fn stop(&self) {
        self.stop.store(true, Ordering::Relaxed);
    }

    async fn run(self: Arc<Self>) {
        while !self.stop.load(Ordering::Relaxed) {
            let mut source = match RtspSource::open(&self.url).await {
                Ok(s) => s,
                Err(err) => {
                    warn!(url = %self.url, error = %err, "failed to open rtsp source, retrying");
                    tokio::time::sleep(Duration::from_secs(2)).await;
                    continue;
                }
            };
            *self.native_resolution.lock().await = source.native_resolution;

            loop {
                if self.stop.load(Ordering::Relaxed) {
                    return;
                }
                tokio::time::sleep(FRAME_POLL).await;
                let Some(frame) = source.read_frame().await else {
                    warn!(url = %self.url, "rtsp read failed, reopening source");
                    break;
                };
                self.broadcast(&frame, source.native_resolution).await;
            }
        }
    }

    async fn broadcast(&self, frame: &[u8], native: (u32, u32)) {
        let viewers: Vec<ViewerHandle> = self.viewers.lock().await.values().cloned().collect();
        for viewer in viewers {
            if self.stop.load(Ordering::Relaxed) {
                break;
            }
            let Some(jpeg) = recompress_jpeg(frame, viewer.resolution, native, viewer.quality) else {
                continue;
            };
            let data_url = format!("data:image/jpeg;base64,{}", BASE64_STANDARD.encode(jpeg));
            for message in chunk_messages(&data_url) {
                if viewer.sender.send(message).is_err() {
                    break;
                }
            }
        }
    }
}

/// Chunk a `data:image/jpeg;base64,...` payload into ≤32KiB pieces framed as `~<i>~<chunk>`,
/// preceded by a `::<n>::` control message announcing the chunk count. The payload is pure
/// ASCII (base64 alphabet + the `data:` prefix), so byte chunking never splits a UTF-8
/// character.
pub fn chunk_messages(payload: &str) -> Vec<Message> {
    let bytes = payload.as_bytes();
    let chunks: Vec<&[u8]> = if bytes.is_empty() {
        vec![&[]]
    } else {
        bytes.chunks(CHUNK_SIZE).collect()
    };
    let mut messages = Vec::with_capacity(chunks.len() + 1);
    messages.push(Message::Text(format!("::{}::", chunks.len())));
    for (i, chunk) in chunks.into_iter().enumerate() {
        let text = std::str::from_utf8(chunk).unwrap_or_default();
        messages.push(Message::Text(format!("~{i}~{text}")));
    }
    messages
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunk_count_matches_ceil_division() {
        let payload = "data:image/jpeg;base64,".to_string() + &"A".repeat(100_000);
        let messages = chunk_messages(&payload);
        let expected_chunks = (payload.len() + CHUNK_SIZE - 1) / CHUNK_SIZE;
        assert_eq!(messages.len(), expected_chunks + 1);
        let Message::Text(control) = &messages[0] else { panic!("expected control message") };
        assert_eq!(*control, format!("::{expected_chunks}::"));
    }

    #[test]
    fn chunks_reassemble_to_original_payload() {
        let payload = "data:image/jpeg;base64,".to_string() + &"B".repeat(70_000);
        let messages = chunk_messages(&payload);
        let mut reassembled = String::new();
        for message in &messages[1..] {
            let Message::Text(text) = message else { panic!("expected text chunk") };
            let (_, chunk) = text.split_once('~').and_then(|(_, rest)| rest.split_once('~')).unwrap();
            reassembled.push_str(chunk);
        }
        assert_eq!(reassembled, payload);
    }

    #[test]
    fn extract_frame_splits_on_soi_eoi() {
        let mut buffer = vec![0x00, 0xFF, 0xD8, 0x01, 0x02, 0xFF, 0xD9, 0xFF];
        let frame = extract_frame(&mut buffer).unwrap();
        assert_eq!(frame, vec![0xFF, 0xD8, 0x01, 0x02, 0xFF, 0xD9]);
        assert_eq!(buffer, vec![0xFF]);
    }

    fn make_jpeg(width: u32, height: u32, quality: u8) -> Vec<u8> {
        // A patterned (not flat) image so JPEG output size actually varies with quality.
        let img = image::RgbImage::from_fn(width, height, |x, y| {
            image::Rgb([((x * 37 + y * 11) % 256) as u8, ((x * 19) % 256) as u8, ((y * 53) % 256) as u8])
        });
        let mut out = Vec::new();
        let encoder = image::codecs::jpeg::JpegEncoder::new_with_quality(&mut out, quality);
        image::DynamicImage::ImageRgb8(img).write_with_encoder(encoder).unwrap();
        out
    }

    #[test]
    fn recompress_jpeg_skips_only_when_quality_zero_and_no_resize() {
        let native = (8, 8);
        let frame = make_jpeg(native.0, native.1, 100);

        assert_eq!(recompress_jpeg(&frame, (0, 0), native, 0).unwrap(), frame);
        assert_eq!(recompress_jpeg(&frame, native, native, 0).unwrap(), frame);

        // a non-zero quality recompresses even when no resize was requested
        let recompressed = recompress_jpeg(&frame, (0, 0), native, 10).unwrap();
        assert_ne!(recompressed, frame);
        assert!(recompressed.len() < frame.len());
    }

    #[test]
    fn recompress_jpeg_resizes_to_requested_resolution() {
        let native = (8, 8);
        let frame = make_jpeg(native.0, native.1, 90);
        let resized = recompress_jpeg(&frame, (4, 4), native, 0).unwrap();
        let decoded = image::load_from_memory_with_format(&resized, ImageFormat::Jpeg).unwrap();
        assert_eq!((decoded.width(), decoded.height()), (4, 4));
    }

    #[tokio::test]
    async fn two_viewers_at_different_resolutions_share_one_decoder_independently() {
        let decoder = CameraDecoder {
            url: "rtsp://10.0.0.5/stream1".to_string(),
            viewers: Mutex::new(HashMap::new()),
            stop: Arc::new(AtomicBool::new(false)),
            native_resolution: Mutex::new((8, 8)),
        };
        let (tx_a, mut rx_a) = mpsc::unbounded_channel();
        let (tx_b, mut rx_b) = mpsc::unbounded_channel();
        decoder.attach(ViewerHandle { id: 1, resolution: (4, 4), quality: 0, sender: tx_a }).await;
        decoder.attach(ViewerHandle { id: 2, resolution: (0, 0), quality: 0, sender: tx_b }).await;

        let frame = make_jpeg(8, 8, 90);
        decoder.broadcast(&frame, (8, 8)).await;

        let Message::Text(control_a) = rx_a.recv().await.unwrap() else { panic!("expected control message") };
        assert!(control_a.starts_with("::"));
        let Message::Text(control_b) = rx_b.recv().await.unwrap() else { panic!("expected control message") };
        assert!(control_b.starts_with("::"));

        // detaching one viewer leaves the other attached and still receiving frames
        decoder.detach(1).await;
        decoder.broadcast(&frame, (8, 8)).await;
        assert!(rx_a.try_recv().is_err());
        assert!(rx_b.recv().await.is_some());
    }
}
