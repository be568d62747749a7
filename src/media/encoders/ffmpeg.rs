// SPDX-License-Identifier: GPL-3.0-only

//! FFmpeg compression engine

use super::CodecEngine;
use crate::config::EncoderConfig;
use crate::errors::{EncodeError, EncodeResult};
use crate::media::frame_convert::PlanarFrame;
use ac_ffmpeg::codec::video::{PixelFormat, VideoEncoder, VideoFrameMut};
use ac_ffmpeg::codec::{Encoder, video};
use ac_ffmpeg::packet::Packet;
use ac_ffmpeg::time::{TimeBase, Timestamp};
use tracing::{debug, info};

/// Encoders that understand the x264-style `preset`, `tune` and `crf` options
fn is_x26x_family(codec: &str) -> bool {
    codec.contains("264") || codec.contains("265") || codec.contains("hevc")
}

/// Encoded packet as produced by FFmpeg
pub struct FfmpegPacket(Packet);

impl AsRef<[u8]> for FfmpegPacket {
    fn as_ref(&self) -> &[u8] {
        self.0.data()
    }
}

/// [`CodecEngine`] backed by an FFmpeg video encoder
pub struct FfmpegEngine {
    encoder: VideoEncoder,
    pixel_format: PixelFormat,
    time_base: TimeBase,
    codec_name: String,
    width: usize,
    height: usize,
}

// SAFETY: the encoder context is only ever used by one thread at a time; it
// is moved between the caller and the encode thread, never shared
unsafe impl Send for FfmpegEngine {}

impl FfmpegEngine {
    /// Find the encoder by name and open it with `config`
    pub fn open(config: &EncoderConfig) -> EncodeResult<Self> {
        config.validate()?;

        let width = config.width as usize;
        let height = config.height as usize;
        let time_base = TimeBase::new(1, config.fps as i32);
        let pixel_format = video::frame::get_pixel_format("yuv420p");

        let mut builder = VideoEncoder::builder(&config.codec)
            .map_err(|e| EncodeError::CodecNotFound(format!("{}: {}", config.codec, e)))?
            .pixel_format(pixel_format)
            .width(width)
            .height(height)
            .time_base(time_base);

        for (key, value) in Self::codec_options(config) {
            debug!(codec = %config.codec, key, value = %value, "Setting encoder option");
            builder = builder.set_option(key, value);
        }

        let encoder = builder
            .build()
            .map_err(|e| EncodeError::Open(format!("{}: {}", config.codec, e)))?;

        info!(
            codec = %config.codec,
            width,
            height,
            fps = config.fps,
            "Opened encoder"
        );

        Ok(Self {
            encoder,
            pixel_format,
            time_base,
            codec_name: config.codec.clone(),
            width,
            height,
        })
    }

    /// Options passed to the encoder; unset fields keep FFmpeg's defaults
    fn codec_options(config: &EncoderConfig) -> Vec<(&'static str, String)> {
        let mut options = Vec::new();
        if let Some(bitrate) = config.bitrate {
            options.push(("b", bitrate.to_string()));
        }
        if let Some(gop) = config.gop_size {
            options.push(("g", gop.to_string()));
        }
        if let Some(b_frames) = config.b_frames {
            options.push(("bf", b_frames.to_string()));
        }
        if is_x26x_family(&config.codec) {
            if let Some(preset) = &config.preset {
                options.push(("preset", preset.clone()));
            }
            if let Some(tune) = &config.tune {
                options.push(("tune", tune.clone()));
            }
            if let Some(crf) = config.crf {
                options.push(("crf", crf.to_string()));
            }
        }
        options
    }

    fn to_video_frame(&self, frame: &PlanarFrame) -> EncodeResult<video::VideoFrame> {
        if frame.width as usize != self.width || frame.height as usize != self.height {
            return Err(EncodeError::InvalidGeometry(format!(
                "frame is {}x{}, encoder expects {}x{}",
                frame.width, frame.height, self.width, self.height
            )));
        }

        let mut video_frame = VideoFrameMut::black(self.pixel_format, self.width, self.height)
            .with_time_base(self.time_base)
            .with_pts(Timestamp::new(frame.pts, self.time_base));

        let sources = [frame.y_plane(), frame.u_plane(), frame.v_plane()];
        let widths = [self.width, self.width / 2, self.width / 2];
        let rows = [self.height, self.height / 2, self.height / 2];

        for (index, source) in sources.iter().enumerate() {
            let mut planes = video_frame.planes_mut();
            let plane = planes[index].data_mut();
            let line_size = plane.len() / rows[index];
            copy_rows(source, widths[index], line_size, rows[index], plane);
        }

        Ok(video_frame.freeze())
    }
}

/// Copy packed rows into a plane whose lines may be padded
fn copy_rows(source: &[u8], width: usize, line_size: usize, rows: usize, destination: &mut [u8]) {
    if line_size == width {
        let len = width * rows;
        destination[..len].copy_from_slice(&source[..len]);
        return;
    }
    for (row, line) in source.chunks_exact(width).take(rows).enumerate() {
        let start = row * line_size;
        destination[start..start + width].copy_from_slice(line);
    }
}

impl CodecEngine for FfmpegEngine {
    type Packet = FfmpegPacket;

    fn send_frame(&mut self, frame: Option<&PlanarFrame>) -> EncodeResult<()> {
        match frame {
            Some(frame) => {
                let video_frame = self.to_video_frame(frame)?;
                self.encoder
                    .push(video_frame)
                    .map_err(|e| EncodeError::Submit(e.to_string()))
            }
            None => self
                .encoder
                .flush()
                .map_err(|e| EncodeError::Submit(e.to_string())),
        }
    }

    fn receive_packet(&mut self) -> EncodeResult<Option<FfmpegPacket>> {
        self.encoder
            .take()
            .map(|packet| packet.map(FfmpegPacket))
            .map_err(|e| EncodeError::Receive(e.to_string()))
    }

    fn name(&self) -> &str {
        &self.codec_name
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_x26x_options_only_for_x26x() {
        let mut config = EncoderConfig {
            preset: Some("veryfast".into()),
            tune: Some("zerolatency".into()),
            crf: Some(23),
            ..EncoderConfig::default()
        };
        let keys: Vec<_> = FfmpegEngine::codec_options(&config)
            .into_iter()
            .map(|(k, _)| k)
            .collect();
        assert_eq!(keys, vec!["b", "g", "bf", "preset", "tune", "crf"]);

        config.codec = "mpeg4".into();
        let keys: Vec<_> = FfmpegEngine::codec_options(&config)
            .into_iter()
            .map(|(k, _)| k)
            .collect();
        assert_eq!(keys, vec!["b", "g", "bf"]);
    }

    #[test]
    fn test_unset_options_are_not_passed() {
        let config = EncoderConfig {
            bitrate: None,
            gop_size: None,
            b_frames: None,
            ..EncoderConfig::default()
        };
        assert!(FfmpegEngine::codec_options(&config).is_empty());
    }

    #[test]
    fn test_copy_rows_into_padded_plane() {
        let source = [1, 2, 3, 4];
        let mut plane = [0u8; 8];
        copy_rows(&source, 2, 4, 2, &mut plane);
        assert_eq!(plane, [1, 2, 0, 0, 3, 4, 0, 0]);
    }
}
