use std::collections::TryReserveError;

use image::imageops::FilterType;
use image::{DynamicImage, GrayImage, RgbImage};
use image_resize_common::frame::{Encoding, ImageFrame, UnknownEncoding};
use image_resize_common::topics::{OUTPUT_CHANNEL, ROOT_NAMESPACE};
use tracing::debug;

use crate::channel::{Advertise, ChannelCache, ChannelCreationError, PublishError, Publisher};

/// Fixed downscale factor applied to both dimensions.
const SCALE: f64 = 0.5;

/// Encoding of every frame this node publishes.
pub const OUTPUT_ENCODING: Encoding = Encoding::Bgr8;

#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error(transparent)]
    UnsupportedEncoding(#[from] UnknownEncoding),
    #[error("row step {step} is smaller than {min} bytes of pixel data per row")]
    StepTooSmall { step: usize, min: usize },
    #[error("pixel buffer too short: got {got} bytes, expected {expected}")]
    Truncated { got: usize, expected: usize },
}

#[derive(Debug, thiserror::Error)]
pub enum AllocationError {
    #[error("destination {width}x{height} has no pixels")]
    ZeroSized { width: u32, height: u32 },
    #[error("destination {width}x{height} exceeds addressable memory")]
    TooLarge { width: u32, height: u32 },
    #[error("could not reserve {bytes} bytes for destination")]
    Reserve {
        bytes: usize,
        #[source]
        source: TryReserveError,
    },
}

#[derive(Debug, thiserror::Error)]
pub enum TransformError {
    #[error("decode failed: {0}")]
    Decode(#[from] DecodeError),
    #[error("allocation failed: {0}")]
    Allocation(#[from] AllocationError),
    #[error(transparent)]
    Channel(#[from] ChannelCreationError),
    #[error(transparent)]
    Publish(#[from] PublishError),
}

impl TransformError {
    /// Fatal errors leave the node without an output path; everything else
    /// only affects the current frame.
    pub fn is_fatal(&self) -> bool {
        matches!(self, TransformError::Channel(_))
    }
}

/// Output size for one source dimension: `floor(dim * 0.5)`.
pub fn scaled(dim: u32) -> u32 {
    (f64::from(dim) * SCALE) as u32
}

/// A frame's pixels, packed and still in the source channel order.
struct Decoded {
    encoding: Encoding,
    image: DynamicImage,
}

/// Interpret `frame` as-is: no color conversion, only row padding removed.
fn decode(frame: &ImageFrame) -> Result<Decoded, DecodeError> {
    let encoding = frame.pixel_encoding()?;
    let (width, height) = (frame.width, frame.height);

    let row_bytes = width as usize * encoding.channels();
    let step = frame.step as usize;
    if step < row_bytes {
        return Err(DecodeError::StepTooSmall {
            step,
            min: row_bytes,
        });
    }

    let expected = step.saturating_mul(height as usize);
    if frame.data.len() < expected {
        return Err(DecodeError::Truncated {
            got: frame.data.len(),
            expected,
        });
    }

    // Alpha cannot survive into bgr8, so only colour channels are kept and
    // resampled.
    let channels = encoding.channels();
    let kept = channels.min(3);

    let packed: Vec<u8> = if row_bytes == 0 || height == 0 {
        Vec::new()
    } else if step == row_bytes && kept == channels {
        frame.data[..expected].to_vec()
    } else {
        frame
            .data
            .chunks_exact(step)
            .take(height as usize)
            .flat_map(|row| row[..row_bytes].chunks_exact(channels))
            .flat_map(|px| &px[..kept])
            .copied()
            .collect()
    };

    let got = packed.len();
    let image = match kept {
        1 => GrayImage::from_raw(width, height, packed).map(DynamicImage::ImageLuma8),
        _ => RgbImage::from_raw(width, height, packed).map(DynamicImage::ImageRgb8),
    }
    .ok_or(DecodeError::Truncated {
        got,
        expected: width as usize * kept * height as usize,
    })?;

    Ok(Decoded { encoding, image })
}

/// Reserve the `bgr8` output buffer for a `width` x `height` image.
fn allocate_bgr8(width: u32, height: u32) -> Result<Vec<u8>, AllocationError> {
    if width == 0 || height == 0 {
        return Err(AllocationError::ZeroSized { width, height });
    }
    let bytes = (width as usize)
        .checked_mul(height as usize)
        .and_then(|n| n.checked_mul(OUTPUT_ENCODING.channels()))
        .ok_or(AllocationError::TooLarge { width, height })?;

    let mut buf = Vec::new();
    buf.try_reserve_exact(bytes)
        .map_err(|source| AllocationError::Reserve { bytes, source })?;
    Ok(buf)
}

/// Append `src` to `dst` as `bgr8`. `src` holds the colour channels of
/// `encoding` in source order, alpha already removed.
fn encode_bgr8(encoding: Encoding, src: &[u8], dst: &mut Vec<u8>) {
    match encoding {
        Encoding::Bgr8 | Encoding::Bgra8 => dst.extend_from_slice(src),
        Encoding::Mono8 => {
            for &v in src {
                dst.extend_from_slice(&[v, v, v]);
            }
        }
        Encoding::Rgb8 | Encoding::Rgba8 => {
            for px in src.chunks_exact(3) {
                dst.extend_from_slice(&[px[2], px[1], px[0]]);
            }
        }
    }
}

/// Downscale `frame` by half with bilinear interpolation and convert the
/// result to `bgr8`. The source header is carried over.
pub fn resize_half(frame: &ImageFrame) -> Result<ImageFrame, TransformError> {
    let decoded = decode(frame)?;

    let (dst_w, dst_h) = (scaled(frame.width), scaled(frame.height));
    let mut data = allocate_bgr8(dst_w, dst_h)?;

    let resampled = decoded
        .image
        .resize_exact(dst_w, dst_h, FilterType::Triangle);
    encode_bgr8(decoded.encoding, resampled.as_bytes(), &mut data);

    Ok(ImageFrame::packed(OUTPUT_ENCODING, dst_w, dst_h, data).with_header_of(frame))
}

/// The per-message callback: resize one frame and publish it on the
/// `resize` channel.
pub struct ResizeNode<A>
where
    A: Advertise<ImageFrame>,
{
    channels: ChannelCache<A, ImageFrame>,
}

impl<A> ResizeNode<A>
where
    A: Advertise<ImageFrame>,
{
    pub fn new(advertiser: A) -> Self {
        Self {
            channels: ChannelCache::new(ROOT_NAMESPACE, advertiser),
        }
    }

    /// Process one inbound frame. On error nothing is published.
    pub fn on_frame(&self, frame: &ImageFrame) -> Result<(), TransformError> {
        let resized = resize_half(frame)?;
        let publisher = self.channels.resolve(OUTPUT_CHANNEL)?;
        publisher.publish(&resized)?;

        debug!(
            seq = frame.seq,
            src = format!("{}x{}", frame.width, frame.height),
            dst = format!("{}x{}", resized.width, resized.height),
            channel = publisher.channel(),
            "published resized frame"
        );
        Ok(())
    }

    pub fn channels(&self) -> &ChannelCache<A, ImageFrame> {
        &self.channels
    }
}
