//! Image decode, transform and encode for thumbnails, `dim` and `resize`.
//!
//! All codec work runs on the blocking pool.

use image::imageops::FilterType;
use image::io::Reader as ImageReader;
use image::{DynamicImage, ImageFormat, ImageOutputFormat};
use std::io::Cursor;
use std::path::PathBuf;
use thiserror::Error;

/// Thumbnails are covered to a square of this many pixels.
pub const THUMBNAIL_SIZE: u32 = 48;

#[derive(Debug, Error)]
pub enum ImagingError {
    #[error("image codec error: {0}")]
    Codec(#[from] image::ImageError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("unsupported image operation: {0}")]
    Unsupported(String),

    #[error("image task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// One `resize` command operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transform {
    Resize { width: u32, height: u32 },
    Crop { x: u32, y: u32, width: u32, height: u32 },
    /// Clockwise rotation; multiples of 90 only.
    Rotate { degrees: i32 },
}

/// Decode `data`, cover it to [`THUMBNAIL_SIZE`] and save a PNG at `dest`.
pub async fn write_thumbnail(data: Vec<u8>, dest: PathBuf) -> Result<(), ImagingError> {
    tokio::task::spawn_blocking(move || -> Result<(), ImagingError> {
        let img = image::load_from_memory(&data)?;
        let thumb = img.resize_to_fill(THUMBNAIL_SIZE, THUMBNAIL_SIZE, FilterType::Triangle);
        if let Some(parent) = dest.parent() {
            std::fs::create_dir_all(parent)?;
        }
        thumb.save_with_format(&dest, ImageFormat::Png)?;
        Ok(())
    })
    .await?
}

/// Pixel dimensions without decoding the whole image.
pub async fn dimensions(data: Vec<u8>) -> Result<(u32, u32), ImagingError> {
    tokio::task::spawn_blocking(move || -> Result<(u32, u32), ImagingError> {
        let dims = ImageReader::new(Cursor::new(data))
            .with_guessed_format()?
            .into_dimensions()?;
        Ok(dims)
    })
    .await?
}

/// Apply a transform and re-encode in the source format.
///
/// `quality` applies to JPEG output only.
pub async fn transform(
    data: Vec<u8>,
    op: Transform,
    quality: Option<u8>,
) -> Result<Vec<u8>, ImagingError> {
    tokio::task::spawn_blocking(move || -> Result<Vec<u8>, ImagingError> {
        let format = image::guess_format(&data)?;
        let img = image::load_from_memory_with_format(&data, format)?;
        let out = apply(img, op)?;
        encode(&out, format, quality)
    })
    .await?
}

fn apply(img: DynamicImage, op: Transform) -> Result<DynamicImage, ImagingError> {
    match op {
        Transform::Resize { width, height } => {
            if width == 0 || height == 0 {
                return Err(ImagingError::Unsupported("zero-sized resize".into()));
            }
            Ok(img.resize_exact(width, height, FilterType::Triangle))
        }
        Transform::Crop {
            x,
            y,
            width,
            height,
        } => Ok(img.crop_imm(x, y, width, height)),
        Transform::Rotate { degrees } => match degrees.rem_euclid(360) {
            0 => Ok(img),
            90 => Ok(img.rotate90()),
            180 => Ok(img.rotate180()),
            270 => Ok(img.rotate270()),
            other => Err(ImagingError::Unsupported(format!(
                "rotation by {other} degrees"
            ))),
        },
    }
}

fn encode(img: &DynamicImage, format: ImageFormat, quality: Option<u8>) -> Result<Vec<u8>, ImagingError> {
    let mut buf = Cursor::new(Vec::new());
    match format {
        ImageFormat::Jpeg => {
            let rgb = DynamicImage::ImageRgb8(img.to_rgb8());
            rgb.write_to(
                &mut buf,
                ImageOutputFormat::Jpeg(quality.unwrap_or(90).clamp(1, 100)),
            )?;
        }
        other => img.write_to(&mut buf, other)?,
    }
    Ok(buf.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgba, RgbaImage};

    fn png(width: u32, height: u32) -> Vec<u8> {
        let img = RgbaImage::from_fn(width, height, |x, _| {
            if x % 2 == 0 {
                Rgba([255, 0, 0, 255])
            } else {
                Rgba([0, 0, 255, 255])
            }
        });
        let mut buf = Cursor::new(Vec::new());
        DynamicImage::ImageRgba8(img)
            .write_to(&mut buf, ImageFormat::Png)
            .unwrap();
        buf.into_inner()
    }

    #[tokio::test]
    async fn test_thumbnail_is_covered_square() {
        let dir = tempfile::TempDir::new().unwrap();
        let dest = dir.path().join("tmb").join("t.png");
        write_thumbnail(png(120, 60), dest.clone()).await.unwrap();
        let dims = dimensions(std::fs::read(&dest).unwrap()).await.unwrap();
        assert_eq!(dims, (THUMBNAIL_SIZE, THUMBNAIL_SIZE));
    }

    #[tokio::test]
    async fn test_undecodable_input_fails() {
        let dir = tempfile::TempDir::new().unwrap();
        let result = write_thumbnail(b"psd?".to_vec(), dir.path().join("x.png")).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_transforms() {
        let rotated = transform(png(30, 10), Transform::Rotate { degrees: 90 }, None)
            .await
            .unwrap();
        assert_eq!(dimensions(rotated).await.unwrap(), (10, 30));

        let cropped = transform(
            png(30, 10),
            Transform::Crop {
                x: 5,
                y: 0,
                width: 10,
                height: 5,
            },
            None,
        )
        .await
        .unwrap();
        assert_eq!(dimensions(cropped).await.unwrap(), (10, 5));

        let err = transform(png(4, 4), Transform::Rotate { degrees: 45 }, None).await;
        assert!(matches!(err, Err(ImagingError::Unsupported(_))));
    }
}
