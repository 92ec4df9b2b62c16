use std::time::Duration;

use anyhow::{Context, Result};
use ffmpeg_next as ffmpeg;
use image::{DynamicImage, RgbImage};
use once_cell::sync::OnceCell;

/// Sampled frames are scaled to this square before hashing; the hash
/// only looks at an 8x8 grid so full resolution buys nothing.
const SAMPLE_FRAME_EDGE: u32 = 160;

/// Give up on a seek target after this many packets without a usable frame
const MAX_PACKETS_PER_SEEK: usize = 600;

static FFMPEG_INIT: OnceCell<()> = OnceCell::new();

/// Initialize FFmpeg once per process
pub fn init_ffmpeg() -> Result<()> {
    FFMPEG_INIT
        .get_or_try_init(|| ffmpeg::init().context("Failed to initialize FFmpeg"))
        .map(|_| ())
}

/// `n` evenly spaced timestamps strictly inside `(0, duration)`
pub fn sample_timestamps(duration: f64, n: usize) -> Vec<f64> {
    if duration.is_nan() || duration <= 0.0 || n == 0 {
        return Vec::new();
    }
    let step = duration / (n + 1) as f64;
    (1..=n).map(|i| step * i as f64).collect()
}

fn stream_duration(input: &ffmpeg::format::context::Input) -> Option<f64> {
    let duration = input.duration();
    if duration <= 0 {
        return None;
    }
    Some(duration as f64 / f64::from(ffmpeg::ffi::AV_TIME_BASE))
}

fn open_stream(url: &str, open_timeout: Duration) -> Result<ffmpeg::format::context::Input> {
    let mut options = ffmpeg::Dictionary::new();
    // microseconds, applies to every blocking read on the protocol
    options.set("rw_timeout", &open_timeout.as_micros().to_string());

    ffmpeg::format::input_with_dictionary(url, options)
        .with_context(|| format!("Failed to open video stream {}", url))
}

/// Copy an RGB24 frame into an image buffer, honoring the row stride
fn frame_to_image(frame: &ffmpeg::util::frame::video::Video) -> Result<DynamicImage> {
    let width = frame.width();
    let height = frame.height();
    let stride = frame.stride(0);
    let row_len = width as usize * 3;
    let data = frame.data(0);

    let mut pixels = Vec::with_capacity(row_len * height as usize);
    for y in 0..height as usize {
        let start = y * stride;
        let row = data
            .get(start..start + row_len)
            .context("Frame buffer shorter than its dimensions")?;
        pixels.extend_from_slice(row);
    }

    let buffer = RgbImage::from_raw(width, height, pixels)
        .context("Failed to create image buffer from frame")?;
    Ok(DynamicImage::ImageRgb8(buffer))
}

struct FrameSampler {
    stream_index: usize,
    time_base: f64,
    decoder: ffmpeg::decoder::Video,
    scaler: ffmpeg::software::scaling::context::Context,
}

impl FrameSampler {
    fn new(input: &ffmpeg::format::context::Input) -> Result<Self> {
        let video_stream = input
            .streams()
            .best(ffmpeg::media::Type::Video)
            .context("Could not find video stream")?;

        let stream_index = video_stream.index();
        let time_base = f64::from(video_stream.time_base());

        let decoder = ffmpeg::codec::context::Context::from_parameters(video_stream.parameters())
            .context("Failed to create codec context")?
            .decoder()
            .video()
            .context("Failed to create video decoder")?;

        let scaler = ffmpeg::software::scaling::context::Context::get(
            decoder.format(),
            decoder.width(),
            decoder.height(),
            ffmpeg::format::Pixel::RGB24,
            SAMPLE_FRAME_EDGE,
            SAMPLE_FRAME_EDGE,
            ffmpeg::software::scaling::flag::Flags::BILINEAR,
        )
        .context("Failed to create scaler")?;

        Ok(Self {
            stream_index,
            time_base,
            decoder,
            scaler,
        })
    }

    fn convert(&mut self, decoded: &ffmpeg::util::frame::video::Video) -> Result<DynamicImage> {
        let mut rgb_frame = ffmpeg::util::frame::video::Video::empty();
        self.scaler
            .run(decoded, &mut rgb_frame)
            .context("Failed to scale frame")?;
        frame_to_image(&rgb_frame)
    }

    /// Decode forward from the current position to the first frame at or
    /// after `target - tolerance` seconds
    fn decode_near(
        &mut self,
        input: &mut ffmpeg::format::context::Input,
        target: f64,
        tolerance: f64,
    ) -> Result<Option<DynamicImage>> {
        let mut decoded = ffmpeg::util::frame::video::Video::empty();
        let mut packets_read = 0;

        for (stream, packet) in input.packets() {
            if stream.index() != self.stream_index {
                continue;
            }
            packets_read += 1;
            if packets_read > MAX_PACKETS_PER_SEEK {
                break;
            }
            if self.decoder.send_packet(&packet).is_err() {
                continue;
            }

            while self.decoder.receive_frame(&mut decoded).is_ok() {
                let frame_time = decoded
                    .timestamp()
                    .or_else(|| decoded.pts())
                    .map(|pts| pts as f64 * self.time_base);

                if matches!(frame_time, Some(t) if t < target - tolerance) {
                    continue;
                }
                return self.convert(&decoded).map(Some);
            }
        }

        Ok(None)
    }

    /// First `n` decodable frames, for containers without a duration
    fn decode_sequential(
        &mut self,
        input: &mut ffmpeg::format::context::Input,
        n: usize,
    ) -> Vec<DynamicImage> {
        let mut frames = Vec::with_capacity(n);
        let mut decoded = ffmpeg::util::frame::video::Video::empty();

        for (stream, packet) in input.packets() {
            if stream.index() != self.stream_index {
                continue;
            }
            if self.decoder.send_packet(&packet).is_err() {
                continue;
            }
            while self.decoder.receive_frame(&mut decoded).is_ok() {
                match self.convert(&decoded) {
                    Ok(frame) => frames.push(frame),
                    Err(e) => log::debug!("Dropping undecodable frame: {:#}", e),
                }
                if frames.len() == n {
                    return frames;
                }
            }
        }

        frames
    }
}

/// Sample up to `n_samples` frames from a (possibly remote) video.
///
/// Only a failed open is an error; a seek or decode failure drops that one
/// sample, so the result can be shorter than requested.
pub fn sample_frames(url: &str, n_samples: usize, open_timeout: Duration) -> Result<Vec<DynamicImage>> {
    init_ffmpeg()?;

    let mut input = open_stream(url, open_timeout)?;
    let mut sampler = FrameSampler::new(&input)?;

    let Some(duration) = stream_duration(&input) else {
        log::debug!("No duration for {}, decoding sequentially", url);
        let frames = sampler.decode_sequential(&mut input, n_samples);
        sampler.decoder.send_eof().ok();
        return Ok(frames);
    };

    let timestamps = sample_timestamps(duration, n_samples);
    let tolerance = duration / (n_samples + 1) as f64 / 2.0;

    log::debug!(
        "Sampling {} frames from {} ({:.2}s long)",
        timestamps.len(),
        url,
        duration
    );

    let mut frames = Vec::with_capacity(timestamps.len());
    for (index, &target) in timestamps.iter().enumerate() {
        let position = (target * f64::from(ffmpeg::ffi::AV_TIME_BASE)) as i64;
        if let Err(e) = input.seek(position, ..position) {
            log::debug!("Seek to {:.2}s failed for {}: {}", target, url, e);
            continue;
        }
        sampler.decoder.flush();

        match sampler.decode_near(&mut input, target, tolerance) {
            Ok(Some(frame)) => frames.push(frame),
            Ok(None) => log::debug!("No frame near {:.2}s in {} (sample {})", target, url, index),
            Err(e) => log::debug!("Sample {} of {} failed: {:#}", index, url, e),
        }
    }

    sampler.decoder.send_eof().ok();

    Ok(frames)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::net::TcpListener;
    use std::thread;

    const CLIP_FRAMES: usize = 30;

    /// 3s YUV4MPEG2 clip at 10 fps; frame `i` is flat grey that brightens with `i`
    fn clip_bytes() -> Vec<u8> {
        let (w, h) = (64usize, 48usize);
        let mut out = format!("YUV4MPEG2 W{} H{} F10:1 Ip A1:1 C420jpeg\n", w, h).into_bytes();
        for i in 0..CLIP_FRAMES {
            out.extend_from_slice(b"FRAME\n");
            out.extend(std::iter::repeat_n(16 + 7 * i as u8, w * h));
            out.extend(std::iter::repeat_n(128u8, w * h / 2));
        }
        out
    }

    fn clip_file() -> tempfile::NamedTempFile {
        let mut file = tempfile::Builder::new().suffix(".y4m").tempfile().unwrap();
        file.write_all(&clip_bytes()).unwrap();
        file.flush().unwrap();
        file
    }

    /// Streams the clip over HTTP without a length, so the container has no duration
    fn serve_clip() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        thread::spawn(move || {
            for stream in listener.incoming() {
                let Ok(mut stream) = stream else { break };
                let mut request = Vec::new();
                let mut buf = [0u8; 1024];
                while !request.windows(4).any(|w| w == b"\r\n\r\n") {
                    match stream.read(&mut buf) {
                        Ok(0) | Err(_) => break,
                        Ok(n) => request.extend_from_slice(&buf[..n]),
                    }
                }
                let head = "HTTP/1.1 200 OK\r\nContent-Type: video/x-yuv4mpeg\r\nConnection: close\r\n\r\n";
                let _ = stream.write_all(head.as_bytes());
                let _ = stream.write_all(&clip_bytes());
            }
        });
        format!("http://{}/clip.y4m", addr)
    }

    fn brightness(frame: &DynamicImage) -> f64 {
        let rgb = frame.to_rgb8();
        let total: f64 = rgb.pixels().map(|p| f64::from(p[0])).sum();
        total / f64::from(rgb.width() * rgb.height())
    }

    #[test]
    fn test_samples_in_temporal_order() {
        let clip = clip_file();
        let path = clip.path().to_string_lossy().into_owned();

        let frames = sample_frames(&path, 6, Duration::from_secs(5)).unwrap();
        assert!(!frames.is_empty());
        assert!(frames.len() <= 6);
        assert!(frames.iter().all(|f| (f.width(), f.height()) == (SAMPLE_FRAME_EDGE, SAMPLE_FRAME_EDGE)));

        let levels: Vec<f64> = frames.iter().map(brightness).collect();
        assert!(levels.windows(2).all(|w| w[0] < w[1]), "{:?}", levels);
    }

    #[test]
    fn test_never_more_samples_than_requested() {
        let clip = clip_file();
        let path = clip.path().to_string_lossy().into_owned();

        let frames = sample_frames(&path, 50, Duration::from_secs(5)).unwrap();
        assert!(frames.len() <= 50);
        let levels: Vec<f64> = frames.iter().map(brightness).collect();
        assert!(levels.windows(2).all(|w| w[0] <= w[1]), "{:?}", levels);
    }

    #[test]
    fn test_unknown_duration_decodes_sequentially() {
        let url = serve_clip();

        let frames = sample_frames(&url, 4, Duration::from_secs(5)).unwrap();
        assert_eq!(frames.len(), 4);
        let levels: Vec<f64> = frames.iter().map(brightness).collect();
        assert!(levels.windows(2).all(|w| w[0] < w[1]), "{:?}", levels);
    }

    #[test]
    fn test_missed_seek_does_not_spoil_next_sample() {
        init_ffmpeg().unwrap();
        let clip = clip_file();
        let path = clip.path().to_string_lossy().into_owned();
        let mut input = open_stream(&path, Duration::from_secs(5)).unwrap();
        let mut sampler = FrameSampler::new(&input).unwrap();

        let mut sample_at = |input: &mut ffmpeg::format::context::Input, target: f64| {
            let position = (target * f64::from(ffmpeg::ffi::AV_TIME_BASE)) as i64;
            input.seek(position, ..position).ok()?;
            sampler.decoder.flush();
            sampler.decode_near(input, target, 0.05).ok().flatten()
        };

        assert!(sample_at(&mut input, 60.0).is_none());
        let frame = sample_at(&mut input, 1.5).unwrap();
        assert!(brightness(&frame) > brightness(&sample_at(&mut input, 0.5).unwrap()));
    }

    #[test]
    fn test_timestamps_are_interior_and_even() {
        let ts = sample_timestamps(14.0, 6);
        assert_eq!(ts, vec![2.0, 4.0, 6.0, 8.0, 10.0, 12.0]);
        assert_eq!(sample_timestamps(10.0, 1), vec![5.0]);
    }

    #[test]
    fn test_timestamps_degenerate_inputs() {
        assert!(sample_timestamps(0.0, 6).is_empty());
        assert!(sample_timestamps(f64::NAN, 6).is_empty());
        assert!(sample_timestamps(30.0, 0).is_empty());
    }

    #[test]
    fn test_unopenable_stream_is_error() {
        let result = sample_frames("/nonexistent/creative.mp4", 6, Duration::from_secs(1));
        assert!(result.is_err());
    }
}
