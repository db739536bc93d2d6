use crate::config::{Config, DecoderConfig, StreamConfig};
use crate::frame::FrameGeometry;
use crate::pipeline::SourceDescriptor;

use super::{ProcessDescriptor, ProcessLauncher, ProcessRole};

pub struct FfmpegLauncher {
    decoder: DecoderConfig,
    stream: StreamConfig,
    geometry: FrameGeometry,
}

impl FfmpegLauncher {
    pub fn new(config: &Config, geometry: FrameGeometry) -> Self {
        Self {
            decoder: config.decoder.clone(),
            stream: config.stream.clone(),
            geometry,
        }
    }
}

impl ProcessLauncher for FfmpegLauncher {
    fn decoder(&self, source: &SourceDescriptor) -> ProcessDescriptor {
        decoder(&self.decoder, source, self.geometry)
    }

    fn encoder(&self) -> ProcessDescriptor {
        encoder(&self.stream, self.geometry)
    }
}

/// Decoder writing back-to-back raw BGR frames of `geometry` to stdout.
pub fn decoder(
    config: &DecoderConfig,
    source: &SourceDescriptor,
    geometry: FrameGeometry,
) -> ProcessDescriptor {
    let mut args: Vec<String> = vec!["-hide_banner".into(), "-loglevel".into(), "warning".into()];

    match source {
        SourceDescriptor::File(path) => {
            if let Some(hwaccel) = &config.hwaccel {
                args.extend(["-hwaccel".into(), hwaccel.clone()]);
            }
            args.extend(["-i".into(), path.display().to_string()]);
        }
        SourceDescriptor::Camera { device } => {
            args.extend([
                "-f".into(),
                "v4l2".into(),
                "-framerate".into(),
                config.capture_fps.to_string(),
                "-video_size".into(),
                geometry.to_string(),
                "-input_format".into(),
                config.input_format.clone(),
                "-i".into(),
                device.clone(),
            ]);
        }
    }

    args.extend([
        "-an".into(),
        "-f".into(),
        "image2pipe".into(),
        "-pix_fmt".into(),
        "bgr24".into(),
        "-vcodec".into(),
        "rawvideo".into(),
        "-vf".into(),
        format!("scale={}:{}", geometry.width(), geometry.height()),
    ]);

    if matches!(source, SourceDescriptor::Camera { .. }) {
        args.extend(["-r".into(), config.capture_fps.to_string()]);
    }

    args.push("-".into());

    ProcessDescriptor {
        name: "decoder".to_string(),
        program: config.ffmpeg.clone(),
        args,
        role: ProcessRole::Decoder,
        fps: config.capture_fps,
        geometry,
    }
}

/// Encoder reading raw BGR frames from stdin and publishing them over RTSP/TCP.
pub fn encoder(config: &StreamConfig, geometry: FrameGeometry) -> ProcessDescriptor {
    let args = vec![
        "-hide_banner".to_string(),
        "-loglevel".to_string(),
        "warning".to_string(),
        "-y".to_string(),
        "-f".to_string(),
        "rawvideo".to_string(),
        "-vcodec".to_string(),
        "rawvideo".to_string(),
        "-pix_fmt".to_string(),
        "bgr24".to_string(),
        "-s".to_string(),
        geometry.to_string(),
        "-r".to_string(),
        config.fps.to_string(),
        "-i".to_string(),
        "-".to_string(),
        "-c:v".to_string(),
        config.codec.clone(),
        "-f".to_string(),
        "rtsp".to_string(),
        "-rtsp_transport".to_string(),
        "tcp".to_string(),
        config.url.clone(),
    ];

    ProcessDescriptor {
        name: "encoder".to_string(),
        program: config.ffmpeg.clone(),
        args,
        role: ProcessRole::Encoder,
        fps: config.fps,
        geometry,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn geometry() -> FrameGeometry {
        FrameGeometry::new(1280, 720).unwrap()
    }

    fn has_pair(args: &[String], flag: &str, value: &str) -> bool {
        args.windows(2).any(|w| w[0] == flag && w[1] == value)
    }

    #[test]
    fn file_decoder_outputs_raw_bgr_to_stdout() {
        let config = DecoderConfig {
            hwaccel: Some("rkmpp".to_string()),
            ..DecoderConfig::default()
        };
        let source = SourceDescriptor::File(PathBuf::from("clips/door.mp4"));
        let desc = decoder(&config, &source, geometry());

        assert_eq!(desc.role, ProcessRole::Decoder);
        assert!(has_pair(&desc.args, "-hwaccel", "rkmpp"));
        assert!(has_pair(&desc.args, "-i", "clips/door.mp4"));
        assert!(has_pair(&desc.args, "-pix_fmt", "bgr24"));
        assert!(has_pair(&desc.args, "-vf", "scale=1280:720"));
        assert!(!desc.args.iter().any(|a| a == "v4l2"));
        assert_eq!(desc.args.last().map(String::as_str), Some("-"));
    }

    #[test]
    fn camera_decoder_uses_capture_fps() {
        let config = DecoderConfig {
            capture_fps: 15,
            ..DecoderConfig::default()
        };
        let source = SourceDescriptor::Camera {
            device: "/dev/video0".to_string(),
        };
        let desc = decoder(&config, &source, geometry());

        assert!(has_pair(&desc.args, "-f", "v4l2"));
        assert!(has_pair(&desc.args, "-framerate", "15"));
        assert!(has_pair(&desc.args, "-video_size", "1280x720"));
        assert!(has_pair(&desc.args, "-input_format", "mjpeg"));
        assert!(has_pair(&desc.args, "-i", "/dev/video0"));
        assert!(has_pair(&desc.args, "-r", "15"));
        assert_eq!(desc.fps, 15);
    }

    #[test]
    fn encoder_streams_rtsp_over_tcp() {
        let config = StreamConfig {
            url: "rtsp://192.168.1.236/live/yolo".to_string(),
            codec: "h264_rkmpp".to_string(),
            ..StreamConfig::default()
        };
        let desc = encoder(&config, geometry());

        assert_eq!(desc.role, ProcessRole::Encoder);
        assert!(has_pair(&desc.args, "-s", "1280x720"));
        assert!(has_pair(&desc.args, "-i", "-"));
        assert!(has_pair(&desc.args, "-c:v", "h264_rkmpp"));
        assert!(has_pair(&desc.args, "-rtsp_transport", "tcp"));
        assert_eq!(
            desc.args.last().map(String::as_str),
            Some("rtsp://192.168.1.236/live/yolo")
        );
    }
}
