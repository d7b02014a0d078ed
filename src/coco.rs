//! COCO manifest model
//!
//! Serde view of the COCO detection format (`images[]`, `annotations[]`,
//! `categories[]`) plus the lookup tables the transfer pipeline needs. The
//! manifest is loaded once per run and treated as read-only afterwards.

use crate::error::{Result, TransferError};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::Path;

/// A COCO-format dataset manifest.
///
/// Unknown fields are ignored so manifests with exporter-specific extras
/// (licenses, info blocks) still load. `images` must be present;
/// `annotations` and `categories` default to empty, which is valid for
/// stream-upload runs that never look at boxes.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CocoManifest {
    pub images: Vec<CocoImage>,
    #[serde(default)]
    pub annotations: Vec<CocoAnnotation>,
    #[serde(default)]
    pub categories: Vec<CocoCategory>,
}

/// One image record: identity, remote location, dimensions.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CocoImage {
    pub id: u64,
    #[serde(default)]
    pub file_name: String,
    #[serde(alias = "url")]
    pub coco_url: String,
    pub width: u32,
    pub height: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date_captured: Option<String>,
}

/// One annotation record: a labeled bounding box on an image.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CocoAnnotation {
    pub id: u64,
    pub image_id: u64,
    pub category_id: u64,
    pub bbox: BBox,
}

/// One category record.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CocoCategory {
    pub id: u64,
    pub name: String,
}

/// A COCO bounding box, `[x, y, width, height]` in pixel units.
///
/// COCO stores boxes as a bare 4-element array, so this type has custom
/// serde implementations rather than named fields on the wire.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BBox {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

/// A bounding box resolved to whole pixels inside a concrete image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PixelBox {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl<'de> Deserialize<'de> for BBox {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let raw = <[f64; 4]>::deserialize(deserializer)?;
        Ok(Self {
            x: raw[0],
            y: raw[1],
            width: raw[2],
            height: raw[3],
        })
    }
}

impl Serialize for BBox {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        [self.x, self.y, self.width, self.height].serialize(serializer)
    }
}

impl BBox {
    /// Convert to relative `[x, y, w, h]` coordinates in `0.0..=1.0`,
    /// the form the dataset platform expects for detections.
    #[must_use]
    pub fn to_relative(&self, image_width: u32, image_height: u32) -> [f64; 4] {
        let w = f64::from(image_width.max(1));
        let h = f64::from(image_height.max(1));
        [self.x / w, self.y / h, self.width / w, self.height / h]
    }

    /// Resolve the box to whole pixels inside an `image_width` x
    /// `image_height` image.
    ///
    /// Width and height are rounded first; the origin is then shifted so the
    /// rounded box fits inside the image, which keeps the output crop at
    /// exactly the rounded `(w, h)` whenever the image is large enough.
    /// Returns `None` for boxes that round to zero area or exceed the image
    /// in either dimension.
    #[must_use]
    pub fn to_pixels(&self, image_width: u32, image_height: u32) -> Option<PixelBox> {
        let width = self.width.round();
        let height = self.height.round();
        if width < 1.0 || height < 1.0 || width > f64::from(image_width) || height > f64::from(image_height) {
            return None;
        }
        let width = width as u32;
        let height = height as u32;

        let x = self.x.round().max(0.0) as u32;
        let y = self.y.round().max(0.0) as u32;
        // Shift the origin back so the box stays inside the image.
        let x = x.min(image_width - width);
        let y = y.min(image_height - height);

        Some(PixelBox {
            x,
            y,
            width,
            height,
        })
    }
}

impl CocoManifest {
    /// Load a manifest from a JSON file.
    ///
    /// # Errors
    /// - File cannot be read
    /// - JSON does not match the COCO schema
    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path_ref = path.as_ref();
        let data = std::fs::read_to_string(path_ref)
            .map_err(|e| TransferError::file_io_error("read manifest", path_ref, &e))?;
        Self::parse(&data).map_err(|e| {
            TransferError::manifest_error(format!("{}: {}", path_ref.display(), e))
        })
    }

    /// Parse a manifest from a JSON string.
    pub fn parse(data: &str) -> Result<Self> {
        serde_json::from_str(data).map_err(|e| TransferError::manifest_error(e.to_string()))
    }

    /// Category names keyed by category id.
    #[must_use]
    pub fn category_names(&self) -> HashMap<u64, &str> {
        self.categories
            .iter()
            .map(|c| (c.id, c.name.as_str()))
            .collect()
    }

    /// Image records keyed by image id.
    #[must_use]
    pub fn images_by_id(&self) -> HashMap<u64, &CocoImage> {
        self.images.iter().map(|img| (img.id, img)).collect()
    }

    /// Annotations grouped by image id, preserving manifest order within
    /// each group.
    #[must_use]
    pub fn annotations_by_image(&self) -> HashMap<u64, Vec<&CocoAnnotation>> {
        let mut grouped: HashMap<u64, Vec<&CocoAnnotation>> = HashMap::new();
        for ann in &self.annotations {
            grouped.entry(ann.image_id).or_default().push(ann);
        }
        grouped
    }
}

impl CocoImage {
    /// A filesystem- and object-key-safe name for this image.
    ///
    /// Flattens `file_name` to its final path component. Records with no
    /// usable name fall back to a digest of the URL so every image still
    /// gets a stable, collision-resistant target.
    #[must_use]
    pub fn safe_file_name(&self) -> String {
        let flattened = self
            .file_name
            .rsplit(['/', '\\'])
            .next()
            .unwrap_or("")
            .trim();
        if !flattened.is_empty() && flattened != "." && flattened != ".." {
            return flattened.to_string();
        }
        hashed_name(&self.coco_url)
    }

    /// `safe_file_name` without its extension, for deriving crop names.
    #[must_use]
    pub fn file_stem(&self) -> String {
        let name = self.safe_file_name();
        match name.rsplit_once('.') {
            Some((stem, _)) if !stem.is_empty() => stem.to_string(),
            _ => name,
        }
    }
}

/// Stable name derived from a URL, keeping the URL's extension when it has
/// one. Same digest-prefix approach the rest of the tooling uses for
/// cache-safe identifiers.
fn hashed_name(url: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(url.as_bytes());
    let digest = format!("{:x}", hasher.finalize());
    let prefix = digest.get(..16).unwrap_or(&digest);
    let extension = url
        .rsplit('/')
        .next()
        .and_then(|segment| segment.split('?').next())
        .and_then(|segment| segment.rsplit_once('.'))
        .map(|(_, ext)| ext)
        .filter(|ext| !ext.is_empty() && ext.len() <= 4 && ext.chars().all(char::is_alphanumeric))
        .unwrap_or("jpg");
    format!("{}.{}", prefix, extension)
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"{
        "images": [
            {"id": 1, "file_name": "a.png", "coco_url": "https://host/a.png", "width": 640, "height": 480},
            {"id": 2, "file_name": "b.png", "coco_url": "https://host/b.png", "width": 320, "height": 240}
        ],
        "annotations": [
            {"id": 10, "image_id": 1, "category_id": 7, "bbox": [10.0, 20.0, 100.0, 50.0]},
            {"id": 11, "image_id": 1, "category_id": 8, "bbox": [0.0, 0.0, 32.0, 32.0]}
        ],
        "categories": [
            {"id": 7, "name": "Sebastes"},
            {"id": 8, "name": "Rathbunaster californicus"}
        ]
    }"#;

    #[test]
    fn test_parse_minimal_manifest() {
        let manifest = CocoManifest::parse(MINIMAL).unwrap();
        assert_eq!(manifest.images.len(), 2);
        assert_eq!(manifest.annotations.len(), 2);
        assert_eq!(manifest.categories.len(), 2);
        assert_eq!(manifest.annotations[0].bbox.width, 100.0);
    }

    #[test]
    fn test_missing_annotations_defaults_empty() {
        let manifest = CocoManifest::parse(
            r#"{"images": [{"id": 1, "file_name": "a.png", "coco_url": "u", "width": 1, "height": 1}]}"#,
        )
        .unwrap();
        assert!(manifest.annotations.is_empty());
        assert!(manifest.categories.is_empty());
    }

    #[test]
    fn test_missing_images_is_error() {
        assert!(CocoManifest::parse(r#"{"annotations": []}"#).is_err());
    }

    #[test]
    fn test_lookup_tables() {
        let manifest = CocoManifest::parse(MINIMAL).unwrap();
        assert_eq!(manifest.category_names()[&7], "Sebastes");
        assert_eq!(manifest.images_by_id()[&2].width, 320);
        let grouped = manifest.annotations_by_image();
        assert_eq!(grouped[&1].len(), 2);
        assert_eq!(grouped[&1][0].id, 10);
        assert!(!grouped.contains_key(&2));
    }

    #[test]
    fn test_bbox_roundtrips_as_array() {
        let json = serde_json::to_string(&BBox {
            x: 1.0,
            y: 2.0,
            width: 3.0,
            height: 4.0,
        })
        .unwrap();
        assert_eq!(json, "[1.0,2.0,3.0,4.0]");
    }

    #[test]
    fn test_to_pixels_interior_box_is_exact() {
        let bbox = BBox {
            x: 10.2,
            y: 20.7,
            width: 100.4,
            height: 50.5,
        };
        let px = bbox.to_pixels(640, 480).unwrap();
        assert_eq!((px.width, px.height), (100, 51));
        assert_eq!((px.x, px.y), (10, 21));
    }

    #[test]
    fn test_to_pixels_clamps_overhanging_box() {
        let bbox = BBox {
            x: 600.0,
            y: 470.0,
            width: 100.0,
            height: 50.0,
        };
        let px = bbox.to_pixels(640, 480).unwrap();
        // Shifted back inside; size preserved.
        assert_eq!((px.width, px.height), (100, 50));
        assert_eq!((px.x, px.y), (540, 430));
    }

    #[test]
    fn test_to_pixels_rejects_degenerate_boxes() {
        let zero = BBox {
            x: 5.0,
            y: 5.0,
            width: 0.2,
            height: 10.0,
        };
        assert!(zero.to_pixels(640, 480).is_none());

        let oversized = BBox {
            x: 0.0,
            y: 0.0,
            width: 700.0,
            height: 10.0,
        };
        assert!(oversized.to_pixels(640, 480).is_none());
    }

    #[test]
    fn test_to_relative() {
        let bbox = BBox {
            x: 64.0,
            y: 48.0,
            width: 320.0,
            height: 240.0,
        };
        let rel = bbox.to_relative(640, 480);
        assert_eq!(rel, [0.1, 0.1, 0.5, 0.5]);
    }

    #[test]
    fn test_safe_file_name_flattens_paths() {
        let image = CocoImage {
            id: 1,
            file_name: "nested/dir/shot.png".to_string(),
            coco_url: "https://host/shot.png".to_string(),
            width: 1,
            height: 1,
            date_captured: None,
        };
        assert_eq!(image.safe_file_name(), "shot.png");
        assert_eq!(image.file_stem(), "shot");
    }

    #[test]
    fn test_safe_file_name_falls_back_to_url_digest() {
        let image = CocoImage {
            id: 1,
            file_name: String::new(),
            coco_url: "https://host/path/img.png?sig=abc".to_string(),
            width: 1,
            height: 1,
            date_captured: None,
        };
        let name = image.safe_file_name();
        assert!(name.ends_with(".png"));
        assert_eq!(name.len(), 16 + 4);
        // Stable across calls.
        assert_eq!(name, image.safe_file_name());
    }
}
