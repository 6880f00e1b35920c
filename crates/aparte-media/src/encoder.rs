//! Opus encode/decode pumps between the audio device and the WebRTC
//! audio track.
//!
//! Capture side: f32 PCM frames from [`crate::audio::AudioDevice`] are
//! encoded (VoIP profile) and written to a `TrackLocalStaticSample`.
//! Playback side: RTP payloads read from the remote track are decoded
//! back into f32 frames for the output device.

use std::sync::Arc;
use std::time::Duration;

use audiopus::coder::{Decoder, Encoder};
use audiopus::{Application, Bitrate, Channels, SampleRate};
use bytes::Bytes;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

use webrtc::media::Sample;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_remote::TrackRemote;

use webrtc::api::media_engine::MIME_TYPE_OPUS;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;

use crate::audio::AudioConfig;

/// Voice bitrate in bps
const VOICE_BITRATE: i32 = 32_000;

/// Upper bound for one encoded Opus frame
const MAX_OPUS_FRAME: usize = 1500;

#[derive(Error, Debug)]
pub enum CodecError {
    #[error("Opus error: {0}")]
    Opus(#[from] audiopus::Error),
}

fn opus_sample_rate(rate: u32) -> SampleRate {
    match rate {
        8_000 => SampleRate::Hz8000,
        12_000 => SampleRate::Hz12000,
        16_000 => SampleRate::Hz16000,
        24_000 => SampleRate::Hz24000,
        _ => SampleRate::Hz48000,
    }
}

fn opus_channels(channels: u16) -> Channels {
    if channels == 1 {
        Channels::Mono
    } else {
        Channels::Stereo
    }
}

/// The local Opus audio track added to the peer connection.
pub fn new_voice_track(config: &AudioConfig) -> Arc<TrackLocalStaticSample> {
    Arc::new(TrackLocalStaticSample::new(
        RTCRtpCodecCapability {
            mime_type: MIME_TYPE_OPUS.to_owned(),
            clock_rate: config.sample_rate,
            channels: config.channels,
            ..Default::default()
        },
        "audio".to_owned(),
        "aparte-voice".to_owned(),
    ))
}

/// Build the VoIP-profile encoder for the capture pipeline.
pub fn voice_encoder(config: &AudioConfig) -> Result<Encoder, CodecError> {
    let mut encoder = Encoder::new(
        opus_sample_rate(config.sample_rate),
        opus_channels(config.channels),
        Application::Voip,
    )?;
    encoder.set_bitrate(Bitrate::BitsPerSecond(VOICE_BITRATE))?;
    Ok(encoder)
}

/// Encode PCM frames and write them to the local audio track until the
/// frame channel closes (capture stopped or session torn down).
pub async fn pump_capture(
    track: Arc<TrackLocalStaticSample>,
    mut frame_rx: mpsc::Receiver<Vec<f32>>,
    encoder: Encoder,
    config: AudioConfig,
) {
    let frame_duration = Duration::from_millis(config.frame_size_ms as u64);
    let mut out = vec![0u8; MAX_OPUS_FRAME];

    while let Some(frame) = frame_rx.recv().await {
        let encoded = match encoder.encode_float(&frame, &mut out) {
            Ok(n) => n,
            Err(e) => {
                warn!(error = %e, "Opus encode failed, dropping frame");
                continue;
            }
        };

        let sample = Sample {
            data: Bytes::copy_from_slice(&out[..encoded]),
            duration: frame_duration,
            ..Default::default()
        };

        if let Err(e) = track.write_sample(&sample).await {
            debug!(error = %e, "Audio track write failed, stopping capture pump");
            break;
        }
        trace!(bytes = encoded, "wrote audio sample");
    }

    debug!("Capture pump finished");
}

/// Read RTP from the remote track, decode, and forward PCM frames to the
/// playback device until the track ends or the receiver is dropped.
pub async fn pump_playback(
    track: Arc<TrackRemote>,
    frame_tx: mpsc::Sender<Vec<f32>>,
    config: AudioConfig,
) {
    let mut decoder = match Decoder::new(
        opus_sample_rate(config.sample_rate),
        opus_channels(config.channels),
    ) {
        Ok(d) => d,
        Err(e) => {
            warn!(error = %e, "Opus decoder init failed, remote audio disabled");
            return;
        }
    };

    let frame_size = config.frame_size_samples();
    let mut pcm = vec![0.0f32; frame_size * 2];

    loop {
        let (packet, _attrs) = match track.read_rtp().await {
            Ok(pair) => pair,
            Err(e) => {
                debug!(error = %e, "Remote track ended");
                break;
            }
        };

        if packet.payload.is_empty() {
            continue;
        }

        let decoded = match decoder.decode_float(Some(&packet.payload[..]), &mut pcm, false) {
            Ok(n) => n,
            Err(e) => {
                warn!(error = %e, "Opus decode failed, dropping packet");
                continue;
            }
        };

        if frame_tx.send(pcm[..decoded].to_vec()).await.is_err() {
            break;
        }
    }

    debug!("Playback pump finished");
}
