//! Outgoing video track
//!
//! Bridges the pipeline's broadcast stream onto a webrtc-rs sample
//! track. The track does not own the stream: it consumes a subscriber
//! handed over by the session.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{broadcast, watch};
use tracing::{debug, info};
use webrtc::media::Sample;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;

use crate::video::frame::VideoFrame;

/// Video track configuration
#[derive(Debug, Clone)]
pub struct TrackConfig {
    /// Track ID
    pub track_id: String,
    /// Stream ID
    pub stream_id: String,
    /// Video codec
    pub codec: VideoCodecType,
    /// RTP clock rate
    pub clock_rate: u32,
}

impl Default for TrackConfig {
    fn default() -> Self {
        Self {
            track_id: "video0".to_string(),
            stream_id: "peerlens-stream".to_string(),
            codec: VideoCodecType::Vp8,
            clock_rate: 90000,
        }
    }
}

/// Video codec type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VideoCodecType {
    Vp8,
    Vp9,
    H264,
}

impl VideoCodecType {
    pub fn mime_type(&self) -> &'static str {
        match self {
            VideoCodecType::Vp8 => "video/VP8",
            VideoCodecType::Vp9 => "video/VP9",
            VideoCodecType::H264 => "video/H264",
        }
    }
}

/// Create the RTP codec capability for a video track
pub fn video_codec_capability(codec: VideoCodecType, clock_rate: u32) -> RTCRtpCodecCapability {
    RTCRtpCodecCapability {
        mime_type: codec.mime_type().to_string(),
        clock_rate,
        ..Default::default()
    }
}

/// Outgoing video track fed from the pipeline's frame stream
pub struct VideoTrack {
    track: Arc<TrackLocalStaticSample>,
    running: Arc<watch::Sender<bool>>,
}

impl VideoTrack {
    /// Create a new video track
    pub fn new(config: &TrackConfig) -> Self {
        let capability = video_codec_capability(config.codec, config.clock_rate);
        let track = Arc::new(TrackLocalStaticSample::new(
            capability,
            config.track_id.clone(),
            config.stream_id.clone(),
        ));
        let (running_tx, _) = watch::channel(false);

        Self {
            track,
            running: Arc::new(running_tx),
        }
    }

    /// Get the underlying sample track
    pub fn sample_track(&self) -> Arc<TrackLocalStaticSample> {
        self.track.clone()
    }

    /// Start writing frames from a broadcast receiver
    pub fn start_sending(&self, mut frame_rx: broadcast::Receiver<VideoFrame>) {
        let _ = self.running.send(true);
        let track = self.track.clone();
        let mut running_rx = self.running.subscribe();

        info!("Starting video track sender");

        tokio::spawn(async move {
            let mut last_frame: Option<Instant> = None;
            loop {
                tokio::select! {
                    result = frame_rx.recv() => match result {
                        Ok(frame) => {
                            let now = Instant::now();
                            let duration = last_frame
                                .map(|t| now.duration_since(t))
                                .filter(|d| !d.is_zero())
                                .unwrap_or(Duration::from_millis(33));
                            last_frame = Some(now);

                            let sample = Sample {
                                data: frame.data_bytes(),
                                duration,
                                timestamp: std::time::SystemTime::now(),
                                ..Default::default()
                            };
                            if let Err(e) = track.write_sample(&sample).await {
                                debug!("Failed to write sample: {}", e);
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            debug!("Video track lagged by {} frames", n);
                        }
                        Err(broadcast::error::RecvError::Closed) => {
                            debug!("Frame channel closed");
                            break;
                        }
                    },
                    _ = running_rx.changed() => {
                        if !*running_rx.borrow() {
                            break;
                        }
                    }
                }
            }
            info!("Video track sender stopped");
        });
    }

    /// Stop sending
    pub fn stop(&self) {
        let _ = self.running.send(false);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codec_capability() {
        let cap = video_codec_capability(VideoCodecType::Vp8, 90000);
        assert_eq!(cap.mime_type, "video/VP8");
        assert_eq!(cap.clock_rate, 90000);
    }

    #[tokio::test]
    async fn test_sender_stops_when_channel_closes() {
        let track = VideoTrack::new(&TrackConfig::default());
        let (tx, rx) = broadcast::channel(4);
        track.start_sending(rx);
        drop(tx);
        // sender task exits on Closed; nothing to assert beyond no panic
        tokio::task::yield_now().await;
        track.stop();
    }
}
