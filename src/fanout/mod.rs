pub mod decoder;
pub mod mjpeg;
pub mod ws;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::Mutex;

use decoder::CameraDecoder;

/// Shared fanout state: the at-most-one-decoder-per-URL map and the `/live/<id>` → RTSP URL
/// registry consumed by the MJPEG pusher. `decoders` is never pruned when a URL's viewer set
/// empties — deliberate decoder reuse, avoiding a reconnect storm on every viewer churn,
/// rather than a leak.
#[derive(Default)]
pub struct FanoutState {
    decoders: Mutex<HashMap<String, Arc<CameraDecoder>>>,
    live_urls: Mutex<HashMap<String, String>>,
    next_viewer_id: AtomicU64,
}

impl FanoutState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Find-or-create the `CameraDecoder` for `url`, racing safely under the fanout's own
    /// lock: the find-or-insert step happens entirely while holding it.
    pub async fn decoder_for(&self, url: &str) -> Arc<CameraDecoder> {
        let mut decoders = self.decoders.lock().await;
        if let Some(existing) = decoders.get(url) {
            return Arc::clone(existing);
        }
        let decoder = CameraDecoder::spawn(url.to_string());
        decoders.insert(url.to_string(), Arc::clone(&decoder));
        decoder
    }

    pub fn next_viewer_id(&self) -> u64 {
        self.next_viewer_id.fetch_add(1, Ordering::Relaxed)
    }

    pub async fn register_live_id(&self, id: String, rtsp_url: String) {
        self.live_urls.lock().await.insert(id, rtsp_url);
    }

    pub async fn unregister_live_id(&self, id: &str) {
        self.live_urls.lock().await.remove(id);
    }

    pub async fn live_url(&self, id: &str) -> Option<String> {
        self.live_urls.lock().await.get(id).cloned()
    }

    pub async fn stop_all(&self) {
        for decoder in self.decoders.lock().await.values() {
            decoder.stop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn decoder_for_shares_one_decoder_per_url() {
        let state = FanoutState::new();
        let first = state.decoder_for("rtsp://10.0.0.5/stream1").await;
        let second = state.decoder_for("rtsp://10.0.0.5/stream1").await;
        assert!(Arc::ptr_eq(&first, &second));

        let other = state.decoder_for("rtsp://10.0.0.6/stream1").await;
        assert!(!Arc::ptr_eq(&first, &other));

        state.stop_all().await;
    }

    #[tokio::test]
    async fn decoder_for_is_race_free_under_concurrent_callers() {
        let state = Arc::new(FanoutState::new());
        let mut handles = Vec::new();
        for _ in 0..16 {
            let state = Arc::clone(&state);
            handles.push(tokio::spawn(async move { state.decoder_for("rtsp://10.0.0.9/stream1").await }));
        }
        let mut decoders = Vec::new();
        for handle in handles {
            decoders.push(handle.await.unwrap());
        }
        let first = &decoders[0];
        assert!(decoders.iter().all(|d| Arc::ptr_eq(d, first)));

        state.stop_all().await;
    }
}
