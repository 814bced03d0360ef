//! Reference image directory loading.
//!
//! A directory of `<identity>.jpg|jpeg|png` photos is the enrollment source.
//! Entries come back sorted by file name so a rebuild enumerates identities
//! in the same order every time.

use crate::extractor::ReferenceImage;
use crate::types::{Identity, RawImage};
use std::path::Path;

const REFERENCE_EXTENSIONS: [&str; 3] = ["jpg", "jpeg", "png"];

/// Decode an image file into packed RGB8.
pub fn load_image(path: &Path) -> Result<RawImage, image::ImageError> {
    let rgb = image::open(path)?.to_rgb8();
    let (width, height) = rgb.dimensions();
    Ok(RawImage {
        data: rgb.into_raw(),
        width,
        height,
        source: Some(path.to_path_buf()),
    })
}

fn is_reference_file(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| REFERENCE_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
        .unwrap_or(false)
}

/// Load every reference photo in `dir`.
///
/// Files that fail to decode are logged and skipped. A missing directory
/// yields an empty list.
pub fn load_reference_dir(dir: &Path) -> std::io::Result<Vec<ReferenceImage>> {
    if !dir.exists() {
        tracing::warn!(dir = %dir.display(), "reference directory does not exist");
        return Ok(Vec::new());
    }

    let mut paths: Vec<_> = std::fs::read_dir(dir)?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| path.is_file() && is_reference_file(path))
        .collect();
    paths.sort();

    let mut references = Vec::with_capacity(paths.len());
    for path in paths {
        let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
            continue;
        };
        match load_image(&path) {
            Ok(image) => references.push(ReferenceImage {
                identity: Identity::from_file_stem(stem),
                image,
            }),
            Err(err) => {
                tracing::warn!(path = %path.display(), error = %err, "cannot decode reference image, skipping");
            }
        }
    }

    tracing::info!(dir = %dir.display(), count = references.len(), "loaded reference images");
    Ok(references)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_png(path: &Path) {
        let img = image::RgbImage::from_pixel(4, 2, image::Rgb([10, 20, 30]));
        img.save(path).unwrap();
    }

    #[test]
    fn test_load_reference_dir_sorted_and_filtered() {
        let dir = tempfile::tempdir().unwrap();
        write_png(&dir.path().join("zoe_ray.png"));
        write_png(&dir.path().join("adam_lee.png"));
        std::fs::write(dir.path().join("notes.txt"), "ignore me").unwrap();
        std::fs::write(dir.path().join("broken.jpg"), "not a jpeg").unwrap();

        let refs = load_reference_dir(dir.path()).unwrap();
        let keys: Vec<_> = refs.iter().map(|r| r.identity.key.as_str()).collect();
        assert_eq!(keys, ["adam_lee", "zoe_ray"]);
        assert_eq!(refs[0].identity.display_name, "Adam Lee");
        assert_eq!(refs[0].image.width, 4);
        assert_eq!(refs[0].image.height, 2);
        assert_eq!(refs[0].image.data.len(), 4 * 2 * 3);
        assert_eq!(&refs[0].image.data[..3], &[10, 20, 30]);
    }

    #[test]
    fn test_missing_dir_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let refs = load_reference_dir(&dir.path().join("absent")).unwrap();
        assert!(refs.is_empty());
    }
}
