//! Stall geometry loaded from Pascal VOC annotation files.

use std::{fs, path::Path};

use ml_core::BBox;
use serde::Deserialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum GeometryError {
    #[error("failed to read stall annotation {path}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid stall annotation {path}: {source}")]
    Xml {
        path: String,
        #[source]
        source: quick_xml::DeError,
    },
    #[error("stall annotation {path} declares an empty image size")]
    EmptySize { path: String },
}

#[derive(Debug, Deserialize)]
struct VocAnnotation {
    size: VocSize,
    #[serde(default, rename = "object")]
    objects: Vec<VocObject>,
}

#[derive(Debug, Deserialize)]
struct VocSize {
    width: f32,
    height: f32,
}

#[derive(Debug, Deserialize)]
struct VocObject {
    bndbox: VocBox,
}

#[derive(Debug, Deserialize)]
struct VocBox {
    xmin: f32,
    ymin: f32,
    xmax: f32,
    ymax: f32,
}

/// Ordered stall boxes for one camera, in broadcast-resolution pixels.
#[derive(Debug, Clone, PartialEq)]
pub struct StallGeometry {
    pub stalls: Vec<BBox>,
}

impl StallGeometry {
    pub fn load(path: &Path, broadcast: (i32, i32)) -> Result<Self, GeometryError> {
        let display = path.display().to_string();
        let raw = fs::read_to_string(path).map_err(|source| GeometryError::Read {
            path: display.clone(),
            source,
        })?;
        Self::from_voc(&raw, broadcast).map_err(|err| match err {
            GeometryError::Xml { source, .. } => GeometryError::Xml {
                path: display.clone(),
                source,
            },
            GeometryError::EmptySize { .. } => GeometryError::EmptySize { path: display },
            other => other,
        })
    }

    /// Parse VOC XML and rescale every box from the annotated image size to
    /// `broadcast`, truncating to whole pixels.
    pub fn from_voc(xml: &str, broadcast: (i32, i32)) -> Result<Self, GeometryError> {
        let annotation: VocAnnotation =
            quick_xml::de::from_str(xml).map_err(|source| GeometryError::Xml {
                path: String::new(),
                source,
            })?;
        let size = annotation.size;
        if size.width <= 0.0 || size.height <= 0.0 {
            return Err(GeometryError::EmptySize {
                path: String::new(),
            });
        }

        let x_ratio = broadcast.0 as f32 / size.width;
        let y_ratio = broadcast.1 as f32 / size.height;
        let stalls = annotation
            .objects
            .iter()
            .map(|object| {
                let b = &object.bndbox;
                BBox::new(
                    (b.xmin.trunc() * x_ratio).trunc(),
                    (b.ymin.trunc() * y_ratio).trunc(),
                    (b.xmax.trunc() * x_ratio).trunc(),
                    (b.ymax.trunc() * y_ratio).trunc(),
                )
            })
            .collect();
        Ok(Self { stalls })
    }

    pub fn len(&self) -> usize {
        self.stalls.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stalls.is_empty()
    }
}
