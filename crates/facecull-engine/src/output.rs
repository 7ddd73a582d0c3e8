//! Reading source images and writing accepted images and captions.

use image::{DynamicImage, ImageFormat, ImageReader};
use std::ffi::OsStr;
use std::io::Cursor;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Subdirectory of the output directory that holds caption files.
pub const CAPTIONS_DIR: &str = "captions";

#[derive(Error, Debug)]
pub enum OutputError {
    #[error("{path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to encode {path}: {source}")]
    Encode {
        path: PathBuf,
        source: image::ImageError,
    },
}

/// Decode an image, sniffing the format from content rather than extension.
pub fn decode_image(path: &Path) -> Result<DynamicImage, image::ImageError> {
    ImageReader::open(path)?.with_guessed_format()?.decode()
}

/// Encode `image` to an in-memory JPEG, the format sent to the model.
pub fn encode_jpeg(image: &DynamicImage) -> Result<Vec<u8>, image::ImageError> {
    let mut buf = Vec::new();
    // JPEG has no alpha channel.
    DynamicImage::ImageRgb8(image.to_rgb8()).write_to(&mut Cursor::new(&mut buf), ImageFormat::Jpeg)?;
    Ok(buf)
}

/// Encode `image` to `dest` in the format implied by its extension.
pub fn save_image(image: &DynamicImage, dest: &Path) -> Result<(), OutputError> {
    let format = ImageFormat::from_path(dest).map_err(|source| OutputError::Encode {
        path: dest.to_path_buf(),
        source,
    })?;

    let result = match format {
        ImageFormat::Jpeg => DynamicImage::ImageRgb8(image.to_rgb8()).save_with_format(dest, format),
        ImageFormat::WebP => DynamicImage::ImageRgba8(image.to_rgba8()).save_with_format(dest, format),
        _ => image.save_with_format(dest, format),
    };

    result.map_err(|source| match source {
        image::ImageError::IoError(source) => OutputError::Io {
            path: dest.to_path_buf(),
            source,
        },
        source => OutputError::Encode {
            path: dest.to_path_buf(),
            source,
        },
    })
}

/// Copy an accepted, uncropped source file to `dest` byte for byte.
pub fn copy_original(src: &Path, dest: &Path) -> Result<(), OutputError> {
    if same_file(src, dest) {
        tracing::debug!(path = %src.display(), "output path is the source file; leaving it in place");
        return Ok(());
    }
    std::fs::copy(src, dest).map_err(|source| OutputError::Io {
        path: dest.to_path_buf(),
        source,
    })?;
    Ok(())
}

/// Write `caption` to `{output_dir}/captions/{stem}.txt`, creating the
/// captions directory on demand. `file_name` is the image's original name,
/// kept as an `OsStr` so non-UTF-8 stems survive. Returns the caption path.
pub fn write_caption(
    output_dir: &Path,
    file_name: &OsStr,
    caption: &str,
) -> Result<PathBuf, OutputError> {
    let dir = output_dir.join(CAPTIONS_DIR);
    std::fs::create_dir_all(&dir).map_err(|source| OutputError::Io {
        path: dir.clone(),
        source,
    })?;

    let mut caption_name = Path::new(file_name)
        .file_stem()
        .unwrap_or(file_name)
        .to_os_string();
    caption_name.push(".txt");
    let path = dir.join(caption_name);

    std::fs::write(&path, caption).map_err(|source| OutputError::Io {
        path: path.clone(),
        source,
    })?;
    Ok(path)
}

/// Truncate `text` to at most `limit` characters.
pub fn truncate_chars(text: &str, limit: usize) -> &str {
    match text.char_indices().nth(limit) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

fn same_file(a: &Path, b: &Path) -> bool {
    match (std::fs::canonicalize(a), std::fs::canonicalize(b)) {
        (Ok(a), Ok(b)) => a == b,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{GenericImageView, Rgba, RgbaImage};

    fn sample_rgba() -> DynamicImage {
        DynamicImage::ImageRgba8(RgbaImage::from_fn(8, 6, |x, y| {
            Rgba([(x * 30) as u8, (y * 40) as u8, 200, 128])
        }))
    }

    #[test]
    fn test_truncate_chars() {
        assert_eq!(truncate_chars("hello world", 5), "hello");
        assert_eq!(truncate_chars("short", 50), "short");
        assert_eq!(truncate_chars("héllo", 2), "hé");
        assert_eq!(truncate_chars("", 3), "");
    }

    #[test]
    fn test_write_caption_uses_stem() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_caption(dir.path(), OsStr::new("portrait.final.JPG"), "smiling, outdoors").unwrap();
        assert_eq!(path, dir.path().join("captions").join("portrait.final.txt"));
        assert_eq!(std::fs::read_to_string(path).unwrap(), "smiling, outdoors");
    }

    #[test]
    fn test_save_png_preserves_pixels() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("out.png");
        let image = sample_rgba();
        save_image(&image, &dest).unwrap();

        let reloaded = decode_image(&dest).unwrap();
        assert_eq!(reloaded.dimensions(), (8, 6));
        assert_eq!(reloaded.to_rgba8(), image.to_rgba8());
    }

    #[test]
    fn test_save_jpeg_drops_alpha() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("out.jpeg");
        save_image(&sample_rgba(), &dest).unwrap();
        assert_eq!(decode_image(&dest).unwrap().dimensions(), (8, 6));
    }

    #[test]
    fn test_save_unknown_extension() {
        let dir = tempfile::tempdir().unwrap();
        let err = save_image(&sample_rgba(), &dir.path().join("out.xyz")).unwrap_err();
        assert!(matches!(err, OutputError::Encode { .. }));
    }

    #[test]
    fn test_save_into_missing_directory() {
        let dir = tempfile::tempdir().unwrap();
        let err = save_image(&sample_rgba(), &dir.path().join("missing/out.png")).unwrap_err();
        assert!(matches!(err, OutputError::Io { .. }));
    }

    #[test]
    fn test_copy_original_same_path_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.png");
        std::fs::write(&path, b"bytes").unwrap();
        copy_original(&path, &path).unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"bytes");
    }

    #[test]
    fn test_encode_jpeg_roundtrips_dimensions() {
        let bytes = encode_jpeg(&sample_rgba()).unwrap();
        assert_eq!(&bytes[..2], &[0xFF, 0xD8]);
        let decoded = image::load_from_memory(&bytes).unwrap();
        assert_eq!(decoded.dimensions(), (8, 6));
    }

    #[test]
    fn test_decode_garbage() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.png");
        std::fs::write(&path, b"definitely not an image").unwrap();
        assert!(decode_image(&path).is_err());
    }
}
