use std::path::Path;
use std::process::Stdio;

use tokio::io::{AsyncBufRead, AsyncReadExt, BufReader};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("could not decode image")]
    Image(#[source] image::ImageError),

    #[error("could not decode video: {0}")]
    Video(String),

    #[error("decoder io error")]
    Io(#[from] std::io::Error),

    #[error("decoding was cancelled")]
    Cancelled,
}

/// A single decoded frame: tightly packed BGR, row-major, 3 bytes per pixel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub width: u32,
    pub height: u32,
    pub data: Vec<u8>,
}

impl Frame {
    pub fn new(width: u32, height: u32, data: Vec<u8>) -> Frame {
        debug_assert_eq!(data.len(), width as usize * height as usize * 3);
        Frame { width, height, data }
    }
}

/// Decodes the first frame of a still or animated image into BGR.
pub fn decode_image(data: &[u8]) -> Result<Frame, DecodeError> {
    let decoded = image::load_from_memory(data).map_err(DecodeError::Image)?;
    let rgb = decoded.to_rgb8();
    let (width, height) = (rgb.width(), rgb.height());
    let mut bgr = rgb.into_raw();
    for px in bgr.chunks_exact_mut(3) {
        px.swap(0, 2);
    }
    Ok(Frame::new(width, height, bgr))
}

/// Extracts the key frames of a video by piping ffmpeg's PPM image stream.
///
/// The child is killed and reaped when the token fires mid-stream.
pub async fn video_keyframes(
    path: &Path,
    cancel: &CancellationToken,
) -> Result<Vec<Frame>, DecodeError> {
    debug!(path = %path.display(), "extracting video key frames");
    let mut child = Command::new("ffmpeg")
        .arg("-i")
        .arg(path)
        .args([
            "-vf",
            "select=eq(pict_type\\,I)",
            "-fps_mode",
            "vfr",
            "-f",
            "image2pipe",
            "-vcodec",
            "ppm",
            "-",
        ])
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| DecodeError::Video(format!("could not spawn ffmpeg: {e}")))?;

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| DecodeError::Video("ffmpeg stdout not captured".to_string()))?;
    let mut reader = BufReader::new(stdout);

    let mut frames = Vec::new();
    let result = loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                warn!(path = %path.display(), "cancelling ffmpeg");
                let _ = child.start_kill();
                let _ = child.wait().await;
                return Err(DecodeError::Cancelled);
            }
            frame = read_ppm_frame(&mut reader) => match frame {
                Ok(Some(frame)) => frames.push(frame),
                Ok(None) => break Ok(()),
                Err(e) => break Err(e),
            }
        }
    };
    let status = match &result {
        Ok(()) => child.wait().await?,
        Err(_) => {
            // Stop reading on a parse error; ffmpeg may still be writing, so
            // kill it before reaping to avoid blocking on a full pipe.
            let _ = child.start_kill();
            child.wait().await?
        }
    };
    result?;
    if !status.success() && frames.is_empty() {
        return Err(DecodeError::Video(format!("ffmpeg exited with {status}")));
    }
    if frames.is_empty() {
        return Err(DecodeError::Video("video contained no key frames".to_string()));
    }
    Ok(frames)
}

/// Reads one PPM P6 image from the stream, converting RGB to BGR.
/// Returns `None` on a clean end-of-stream.
pub(crate) async fn read_ppm_frame<R: AsyncBufRead + Unpin>(
    reader: &mut R,
) -> Result<Option<Frame>, DecodeError> {
    let magic = match read_token(reader, true).await? {
        None => return Ok(None),
        Some(token) => token,
    };
    if magic != "P6" {
        return Err(DecodeError::Video(format!("unexpected PPM magic: {magic}")));
    }
    let width: u32 = parse_header_int(read_token(reader, false).await?)?;
    let height: u32 = parse_header_int(read_token(reader, false).await?)?;
    let maxval: u32 = parse_header_int(read_token(reader, false).await?)?;
    if maxval != 255 {
        return Err(DecodeError::Video(format!("unsupported PPM maxval: {maxval}")));
    }

    let len = width as usize * height as usize * 3;
    let mut data = vec![0u8; len];
    reader
        .read_exact(&mut data)
        .await
        .map_err(|e| DecodeError::Video(format!("truncated PPM frame: {e}")))?;
    for px in data.chunks_exact_mut(3) {
        px.swap(0, 2);
    }
    Ok(Some(Frame::new(width, height, data)))
}

fn parse_header_int(token: Option<String>) -> Result<u32, DecodeError> {
    let token = token.ok_or_else(|| DecodeError::Video("truncated PPM header".to_string()))?;
    token
        .parse()
        .map_err(|_| DecodeError::Video(format!("malformed PPM header field: {token}")))
}

/// Reads a whitespace-delimited header token, skipping `#` comments.
/// `None` on EOF; EOF is only clean when it happens before the first byte
/// of a token (`at_frame_start`).
async fn read_token<R: AsyncBufRead + Unpin>(
    reader: &mut R,
    at_frame_start: bool,
) -> Result<Option<String>, DecodeError> {
    let mut token = Vec::new();
    let mut in_comment = false;
    loop {
        let mut byte = [0u8; 1];
        match reader.read(&mut byte).await? {
            0 => {
                if token.is_empty() && at_frame_start {
                    return Ok(None);
                }
                if token.is_empty() {
                    return Err(DecodeError::Video("truncated PPM header".to_string()));
                }
                break;
            }
            _ => {}
        }
        let b = byte[0];
        if in_comment {
            if b == b'\n' {
                in_comment = false;
            }
            continue;
        }
        match b {
            b'#' if token.is_empty() => in_comment = true,
            b' ' | b'\t' | b'\r' | b'\n' => {
                if !token.is_empty() {
                    break;
                }
            }
            _ => token.push(b),
        }
    }
    Ok(Some(String::from_utf8_lossy(&token).into_owned()))
}
