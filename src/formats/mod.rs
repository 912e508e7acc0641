//! Built-in format recognizers.
//!
//! Each format is a [`Format`](crate::registry::Format) implementation; the
//! registry built here is the default input to a carving session.  Embedders
//! can register additional recognizers through
//! [`FormatRegistry::builder`](crate::registry::FormatRegistry::builder).

use std::sync::Arc;

use crate::registry::{Format, FormatRegistry};

pub mod fatdir;
pub mod jpeg;
pub mod png;
pub mod tar;

pub use fatdir::FatDir;
pub use jpeg::Jpeg;
pub use png::Png;
pub use tar::Tar;

/// Registry with every built-in format enabled.
pub fn builtin_registry() -> FormatRegistry {
    registry_with(None)
}

/// Registry restricted to the named formats (by extension); `None` enables
/// everything.  Unknown names are logged and skipped.
pub fn registry_with(enabled: Option<&[String]>) -> FormatRegistry {
    let all: Vec<Arc<dyn Format>> =
        vec![Arc::new(Jpeg), Arc::new(Png), Arc::new(Tar), Arc::new(FatDir)];

    if let Some(names) = enabled {
        for name in names {
            if !all.iter().any(|f| f.stat().extension == name.as_str()) {
                log::warn!("unknown format {name:?} requested, skipping");
            }
        }
    }

    let mut builder = FormatRegistry::builder();
    for format in all {
        let keep = enabled.map_or(true, |names| {
            names.iter().any(|n| n == format.stat().extension)
        });
        if keep {
            builder = builder.register(format);
        }
    }
    builder.build()
}
