//! RTSP network cameras: H.264 over RTSP/TCP, decoded in process.
//!
//! The RTSP session is async; each capture owns a current-thread tokio
//! runtime and blocks on it, so callers keep the synchronous
//! [`CaptureHandle`] contract.

use crate::source::{CameraError, CaptureHandle};
use futures::StreamExt;
use image::{DynamicImage, RgbImage};
use openh264::decoder::Decoder;
use openh264::formats::YUVSource;
use retina::client::{Demuxed, PlayOptions, SessionOptions, SetupOptions, TcpTransportOptions, Transport};
use retina::codec::{CodecItem, ParametersRef};
use std::pin::Pin;
use std::time::Duration;
use tokio::runtime::Runtime;
use url::Url;

/// Upper bound for DESCRIBE, SETUP and PLAY together.
pub const RTSP_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// A stalled stream fails the read instead of hanging the engine.
const RTSP_READ_TIMEOUT: Duration = Duration::from_secs(5);

const ANNEX_B_START: [u8; 4] = [0, 0, 0, 1];

/// The OpenH264 handle is a raw C pointer, which keeps it `!Send`.
struct H264Decoder(Decoder);

// SAFETY: the decoder is owned by exactly one capture and only touched through
// `&mut self`; OpenH264 decoder instances carry no thread affinity.
unsafe impl Send for H264Decoder {}

pub struct RtspCapture {
    url: String,
    runtime: Runtime,
    stream: Pin<Box<Demuxed>>,
    decoder: H264Decoder,
    /// SPS and PPS in Annex B form, sent ahead of every key frame.
    parameter_sets: Vec<u8>,
}

impl RtspCapture {
    pub fn open(uri: &str) -> Result<Self, CameraError> {
        Self::open_with_timeout(uri, RTSP_CONNECT_TIMEOUT)
    }

    /// Connect and start playing the first H.264 video stream.
    pub fn open_with_timeout(uri: &str, timeout: Duration) -> Result<Self, CameraError> {
        let url = Url::parse(uri).map_err(|e| CameraError::Unsupported(format!("{uri}: {e}")))?;
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|e| CameraError::CaptureFailed(format!("rtsp runtime: {e}")))?;

        let connect = connect(url);
        let (stream, parameter_sets) = runtime
            .block_on(async { tokio::time::timeout(timeout, connect).await })
            .map_err(|_| CameraError::Timeout {
                uri: uri.to_string(),
                secs: timeout.as_secs(),
            })??;

        let decoder = Decoder::new()
            .map_err(|e| CameraError::FormatNegotiationFailed(format!("h264 decoder: {e}")))?;

        tracing::info!(url = uri, "rtsp stream opened");
        Ok(Self {
            url: uri.to_string(),
            runtime,
            stream: Box::pin(stream),
            decoder: H264Decoder(decoder),
            parameter_sets,
        })
    }

    fn decode(&mut self, annex_b: &[u8]) -> Result<Option<DynamicImage>, CameraError> {
        let Some(yuv) = self
            .decoder
            .0
            .decode(annex_b)
            .map_err(|e| CameraError::CaptureFailed(format!("h264 decode: {e}")))?
        else {
            return Ok(None);
        };

        let (width, height) = yuv.dimensions();
        let mut rgb = vec![0u8; width * height * 3];
        yuv.write_rgb8(&mut rgb);
        RgbImage::from_raw(width as u32, height as u32, rgb)
            .map(|img| Some(DynamicImage::ImageRgb8(img)))
            .ok_or_else(|| CameraError::CaptureFailed("decoded frame has wrong size".into()))
    }
}

async fn connect(url: Url) -> Result<(Demuxed, Vec<u8>), CameraError> {
    let failed = |step: &str, e: retina::Error| CameraError::CaptureFailed(format!("rtsp {step}: {e}"));

    let mut session = retina::client::Session::describe(
        url,
        SessionOptions::default().user_agent(format!("rollcall/{}", env!("CARGO_PKG_VERSION"))),
    )
    .await
    .map_err(|e| failed("describe", e))?;

    let video = session
        .streams()
        .iter()
        .position(|s| s.media() == "video" && s.encoding_name() == "h264")
        .ok_or(CameraError::StreamingNotSupported)?;

    session
        .setup(
            video,
            SetupOptions::default().transport(Transport::Tcp(TcpTransportOptions::default())),
        )
        .await
        .map_err(|e| failed("setup", e))?;

    let parameter_sets = match session.streams()[video].parameters() {
        Some(ParametersRef::Video(params)) => avcc_parameter_sets(params.extra_data()).unwrap_or_default(),
        _ => Vec::new(),
    };

    let playing = session
        .play(PlayOptions::default())
        .await
        .map_err(|e| failed("play", e))?;
    let demuxed = playing.demuxed().map_err(|e| failed("demux", e))?;
    Ok((demuxed, parameter_sets))
}

/// SPS and PPS from an AVCDecoderConfigurationRecord, as Annex B NAL units.
fn avcc_parameter_sets(record: &[u8]) -> Option<Vec<u8>> {
    let mut out = Vec::new();
    let mut pos = 5;

    let sps_count = usize::from(*record.get(pos)? & 0x1f);
    pos += 1;
    for _ in 0..sps_count {
        pos = copy_nal(record, pos, &mut out)?;
    }

    let pps_count = usize::from(*record.get(pos)?);
    pos += 1;
    for _ in 0..pps_count {
        pos = copy_nal(record, pos, &mut out)?;
    }
    Some(out)
}

/// Copy one u16-length-prefixed NAL at `pos`; returns the position after it.
fn copy_nal(record: &[u8], pos: usize, out: &mut Vec<u8>) -> Option<usize> {
    let len = usize::from(u16::from_be_bytes([*record.get(pos)?, *record.get(pos + 1)?]));
    let nal = record.get(pos + 2..pos + 2 + len)?;
    out.extend_from_slice(&ANNEX_B_START);
    out.extend_from_slice(nal);
    Some(pos + 2 + len)
}

/// Rewrite 4-byte length-prefixed NAL units as Annex B.
fn length_prefixed_to_annex_b(data: &[u8], out: &mut Vec<u8>) -> Option<()> {
    let mut pos = 0;
    while pos < data.len() {
        let len_bytes: [u8; 4] = data.get(pos..pos + 4)?.try_into().ok()?;
        let len = u32::from_be_bytes(len_bytes) as usize;
        let nal = data.get(pos + 4..pos + 4 + len)?;
        out.extend_from_slice(&ANNEX_B_START);
        out.extend_from_slice(nal);
        pos += 4 + len;
    }
    Some(())
}

impl CaptureHandle for RtspCapture {
    /// `None` while the decoder is still buffering.
    fn read_frame(&mut self) -> Result<Option<DynamicImage>, CameraError> {
        let stream = &mut self.stream;
        let next = self
            .runtime
            .block_on(async { tokio::time::timeout(RTSP_READ_TIMEOUT, next_video_frame(stream)).await })
            .map_err(|_| {
                CameraError::CaptureFailed(format!(
                    "no frame from {} within {}s",
                    self.url,
                    RTSP_READ_TIMEOUT.as_secs()
                ))
            })??;

        let Some((key_frame, data)) = next else {
            return Err(CameraError::EndOfStream(self.url.clone()));
        };

        let mut annex_b = Vec::with_capacity(data.len() + self.parameter_sets.len() + 16);
        if key_frame {
            annex_b.extend_from_slice(&self.parameter_sets);
        }
        length_prefixed_to_annex_b(&data, &mut annex_b)
            .ok_or_else(|| CameraError::CaptureFailed("malformed h264 access unit".into()))?;
        self.decode(&annex_b)
    }
}

/// Skip non-video items; `None` when the server ends the stream.
async fn next_video_frame(
    stream: &mut Pin<Box<Demuxed>>,
) -> Result<Option<(bool, Vec<u8>)>, CameraError> {
    while let Some(item) = stream.next().await {
        match item.map_err(|e| CameraError::CaptureFailed(format!("rtsp: {e}")))? {
            CodecItem::VideoFrame(frame) => {
                return Ok(Some((frame.is_random_access_point(), frame.into_data())))
            }
            _ => continue,
        }
    }
    Ok(None)
}

impl Drop for RtspCapture {
    fn drop(&mut self) {
        tracing::info!(url = %self.url, "rtsp stream released");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;

    #[test]
    fn test_avcc_record_yields_sps_then_pps() {
        let record = [
            0x01, 0x64, 0x00, 0x1f, 0xff, // version, profile, compat, level, length size
            0xe1, 0x00, 0x03, 0x67, 0xaa, 0xbb, // one SPS
            0x01, 0x00, 0x02, 0x68, 0xcc, // one PPS
        ];
        assert_eq!(
            avcc_parameter_sets(&record).unwrap(),
            vec![0, 0, 0, 1, 0x67, 0xaa, 0xbb, 0, 0, 0, 1, 0x68, 0xcc]
        );
        assert!(avcc_parameter_sets(&record[..8]).is_none());
    }

    #[test]
    fn test_length_prefixed_units_become_annex_b() {
        let data = [0, 0, 0, 2, 0x65, 0x01, 0, 0, 0, 1, 0x41];
        let mut out = Vec::new();
        length_prefixed_to_annex_b(&data, &mut out).unwrap();
        assert_eq!(out, vec![0, 0, 0, 1, 0x65, 0x01, 0, 0, 0, 1, 0x41]);

        let truncated = [0, 0, 0, 9, 0x65];
        assert!(length_prefixed_to_annex_b(&truncated, &mut Vec::new()).is_none());
    }

    #[test]
    fn test_silent_server_times_out() {
        // Accepts the TCP connection but never answers DESCRIBE.
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let uri = format!("rtsp://127.0.0.1:{port}/stream");

        let err = RtspCapture::open_with_timeout(&uri, Duration::from_millis(300))
            .err()
            .unwrap();
        assert!(matches!(err, CameraError::Timeout { .. }), "{err}");
        drop(listener);
    }

    #[test]
    fn test_refused_connection_fails_fast() {
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let uri = format!("rtsp://127.0.0.1:{port}/stream");
        let err = RtspCapture::open_with_timeout(&uri, Duration::from_secs(5))
            .err()
            .unwrap();
        assert!(matches!(err, CameraError::CaptureFailed(_)), "{err}");
    }
}
