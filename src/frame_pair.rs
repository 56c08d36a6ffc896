//! Frame Pair Cache (B): holds only (previous, current) full-resolution
//! frames under a single mutex.
//!
//! Grounded on the dual-frame rotation in
//! `examples/original_source/circular_buffer.py`'s frame-cache methods and
//! generalized from the single-frame `frame_queue` pattern in
//! `raspberry_pi/rpi_camera.rs`.
//!
//! SPDX-License-Identifier: GPL-3.0-or-later

use image::{GenericImageView, ImageBuffer, Rgb, RgbImage};
use std::sync::Mutex;

/// A full-resolution RGB frame. 2-D (grayscale) sources are up-converted on
/// push so that every frame held by the cache is RGB, matching the "2-D
/// grayscale tolerated with up-conversion on read" contract in the data
/// model.
#[derive(Clone)]
pub struct Frame {
    pub image: RgbImage,
}

impl Frame {
    pub fn from_rgb(width: u32, height: u32, data: Vec<u8>) -> Self {
        let image = ImageBuffer::from_raw(width, height, data)
            .expect("rgb buffer length must match width * height * 3");
        Frame { image }
    }

    pub fn from_luma(width: u32, height: u32, data: Vec<u8>) -> Self {
        let luma = ImageBuffer::<image::Luma<u8>, _>::from_raw(width, height, data)
            .expect("luma buffer length must match width * height");
        Frame {
            image: image::DynamicImage::ImageLuma8(luma).to_rgb8(),
        }
    }

    /// Green channel if RGB, or the whole plane treated as luma if the
    /// source was already single-channel (§4.5: "if the frame arrives as
    /// 2-D (single plane), treat the whole frame as the luminance proxy").
    /// Since `Frame` always stores RGB internally (up-converted on push),
    /// the luma case degrades to reading the green channel of the
    /// up-converted image, which equals the original luma value for every
    /// pixel - so the distinction is preserved without a separate code path.
    pub fn green_channel(&self) -> Vec<u8> {
        self.image.pixels().map(|p| p.0[1]).collect()
    }

    /// Area-average downscale, matching `cv2.INTER_AREA`'s box-filter
    /// semantics (§4.2): each output pixel is the mean of the source pixels
    /// whose proportional footprint falls within it, rather than a weighted
    /// few-tap kernel. The `image` crate's `FilterType` enum has no area-
    /// average variant, so this is hand-rolled rather than picked off the
    /// shelf; it is only ever called at downscale ratios (`detection_resolution`
    /// is validated smaller than the source), so the source-range math below
    /// assumes `width`/`height` are not larger than `self.image`'s.
    pub fn downscale(&self, width: u32, height: u32) -> Frame {
        Frame {
            image: area_average_resize(&self.image, width, height),
        }
    }

    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }
}

/// Box-averages `src` down to `new_width` x `new_height`. Each output pixel
/// maps back to a `[x0, x1) x [y0, y1)` rectangle of source pixels (computed
/// with `u64` intermediates to avoid overflow on large frames) and is the
/// integer mean of every channel over that rectangle.
fn area_average_resize(src: &RgbImage, new_width: u32, new_height: u32) -> RgbImage {
    let (src_width, src_height) = src.dimensions();
    let mut out = ImageBuffer::new(new_width, new_height);

    for y in 0..new_height {
        let y0 = (y as u64 * src_height as u64) / new_height as u64;
        let y1 = (((y as u64 + 1) * src_height as u64) / new_height as u64)
            .max(y0 + 1)
            .min(src_height as u64);

        for x in 0..new_width {
            let x0 = (x as u64 * src_width as u64) / new_width as u64;
            let x1 = (((x as u64 + 1) * src_width as u64) / new_width as u64)
                .max(x0 + 1)
                .min(src_width as u64);

            let mut sum = [0u64; 3];
            let mut count = 0u64;
            for sy in y0..y1 {
                for sx in x0..x1 {
                    let pixel = src.get_pixel(sx as u32, sy as u32);
                    sum[0] += pixel[0] as u64;
                    sum[1] += pixel[1] as u64;
                    sum[2] += pixel[2] as u64;
                    count += 1;
                }
            }
            out.put_pixel(
                x,
                y,
                Rgb([
                    (sum[0] / count) as u8,
                    (sum[1] / count) as u8,
                    (sum[2] / count) as u8,
                ]),
            );
        }
    }

    out
}

#[derive(Default)]
struct FramePairInner {
    previous: Option<Frame>,
    current: Option<Frame>,
}

/// Holds the `(previous, current)` pair. A single mutex guards both slots so
/// that `push` and reads are each atomic with respect to one another.
pub struct FramePair {
    inner: Mutex<FramePairInner>,
}

impl Default for FramePair {
    fn default() -> Self {
        FramePair::new()
    }
}

impl FramePair {
    pub fn new() -> Self {
        FramePair {
            inner: Mutex::new(FramePairInner::default()),
        }
    }

    /// `previous <- current; current <- frame`. Old `previous` is dropped.
    pub fn push(&self, frame: Frame) {
        let mut inner = self.inner.lock().unwrap();
        inner.previous = inner.current.take();
        inner.current = Some(frame);
    }

    /// Downscales both slots to `detection_resolution` *inside the lock* and
    /// returns owned copies - copying ~22 KB downscaled frames rather than
    /// ~6 MB full frames under lock is the load-bearing memory decision
    /// here (§4.2), and it also bounds how long the lock is held.
    pub fn pair_for_detection(&self, detection_resolution: (u32, u32)) -> Option<(Frame, Frame)> {
        let inner = self.inner.lock().unwrap();
        let previous = inner.previous.as_ref()?;
        let current = inner.current.as_ref()?;
        let (w, h) = detection_resolution;
        Some((previous.downscale(w, h), current.downscale(w, h)))
    }

    pub fn current_for_stream(&self) -> Option<Frame> {
        let inner = self.inner.lock().unwrap();
        inner.current.clone()
    }
}
