//! Avatar upload processing.

use std::io::Cursor;
use std::path::Path;

use image::{GenericImageView, ImageFormat, load_from_memory_with_format};

use crate::crypto::digest;

/// Formats accepted on upload, recognized by their magic bytes.
pub const ALLOWED_FORMATS: &[ImageFormat] = &[ImageFormat::Png, ImageFormat::Jpeg];
/// Largest side of a stored avatar.
pub const THUMBNAIL_SIZE: u32 = 128;

#[derive(Debug, thiserror::Error)]
pub enum ImageError {
    #[error("invalid image file")]
    Decode(#[from] image::ImageError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("{0:?} images are not accepted")]
    UnsupportedFormat(ImageFormat),
    #[error("image is {size} bytes while at most {max} are allowed")]
    TooLarge { size: usize, max: usize },
}

/// Check that `buffer` starts like an accepted image.
pub fn allowed_format(buffer: &[u8]) -> Result<ImageFormat, ImageError> {
    let format = image::guess_format(buffer)?;

    if ALLOWED_FORMATS.contains(&format) {
        Ok(format)
    } else {
        Err(ImageError::UnsupportedFormat(format))
    }
}

/// File name of a user's avatar.
pub fn avatar_filename(email: &str) -> String {
    format!("{}.png", digest(email))
}

/// Decode an image and shrink it to fit a 128×128 square, as PNG. Smaller
/// images keep their size.
pub fn process_image(buffer: &[u8]) -> Result<Vec<u8>, ImageError> {
    let format = allowed_format(buffer)?;
    let mut image = load_from_memory_with_format(buffer, format)?;
    if image.width() > THUMBNAIL_SIZE || image.height() > THUMBNAIL_SIZE {
        image = image.thumbnail(THUMBNAIL_SIZE, THUMBNAIL_SIZE);
    }

    let mut output = Cursor::new(Vec::new());
    image.write_to(&mut output, ImageFormat::Png)?;

    Ok(output.into_inner())
}

/// Process and store the avatar of `email` under `dir`, replacing any
/// previous one. Returns the file name.
pub async fn save_avatar(
    dir: &Path,
    email: &str,
    buffer: &[u8],
    max_size: usize,
) -> Result<String, ImageError> {
    if buffer.len() > max_size {
        return Err(ImageError::TooLarge {
            size: buffer.len(),
            max: max_size,
        });
    }

    let png = process_image(buffer)?;
    let filename = avatar_filename(email);

    tokio::fs::create_dir_all(dir).await?;
    tokio::fs::write(dir.join(&filename), png).await?;

    tracing::debug!(%filename, "avatar saved");

    Ok(filename)
}

#[cfg(test)]
mod tests {
    use image::RgbImage;

    use super::*;

    fn png(width: u32, height: u32) -> Vec<u8> {
        let mut output = Cursor::new(Vec::new());
        RgbImage::new(width, height)
            .write_to(&mut output, ImageFormat::Png)
            .unwrap();
        output.into_inner()
    }

    #[test]
    fn test_allowed_format() {
        assert_eq!(allowed_format(&png(4, 4)).unwrap(), ImageFormat::Png);
        assert!(matches!(
            allowed_format(b"GIF89a\x01\x00\x01\x00"),
            Err(ImageError::UnsupportedFormat(ImageFormat::Gif))
        ));
        assert!(matches!(
            allowed_format(b"plain text"),
            Err(ImageError::Decode(_))
        ));
    }

    #[test]
    fn test_process_image() {
        let thumbnail = image::load_from_memory(&process_image(&png(300, 200)).unwrap()).unwrap();
        assert_eq!(thumbnail.width(), THUMBNAIL_SIZE);
        assert!(thumbnail.height() < THUMBNAIL_SIZE);

        assert!(matches!(
            process_image(b"definitely not an image"),
            Err(ImageError::Decode(_))
        ));
    }

    #[tokio::test]
    async fn test_save_avatar() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("avatars");

        let filename = save_avatar(&path, "user@example.com", &png(64, 64), 1024 * 1024)
            .await
            .unwrap();
        assert_eq!(
            filename,
            "b4c9a289323b21a01c3e940f150eb9b8c542587f1abfd8f0e1cc1ffc5e475514.png"
        );

        let stored = image::open(path.join(&filename)).unwrap();
        assert_eq!(stored.dimensions(), (64, 64));

        assert!(matches!(
            save_avatar(&path, "user@example.com", &png(64, 64), 10).await,
            Err(ImageError::TooLarge { max: 10, .. })
        ));

        // Nothing is written for a refused format.
        let gif = b"GIF89a\x40\x00\x40\x00";
        assert!(matches!(
            save_avatar(&path, "other@example.com", gif, 1024).await,
            Err(ImageError::UnsupportedFormat(ImageFormat::Gif))
        ));
        assert!(!path.join(avatar_filename("other@example.com")).exists());
    }
}
