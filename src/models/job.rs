use serde::{Deserialize, Serialize};

/// One desired image variant, or the original itself.
///
/// The derived [`Job::name`] is the correlation key shared by the queue
/// payload, the cache file and the completion bus.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct Job {
    pub original: String,
    pub is_original: bool,
    pub width: u32,
    pub height: u32,
}

impl Job {
    /// A job that refers to the uploaded original, untouched.
    pub fn original(filename: impl Into<String>) -> Self {
        Self {
            original: filename.into(),
            is_original: true,
            width: 0,
            height: 0,
        }
    }

    /// A job for `filename` resized to `width` x `height`.
    pub fn resized(filename: impl Into<String>, width: u32, height: u32) -> Self {
        Self {
            original: filename.into(),
            is_original: false,
            width,
            height,
        }
    }

    /// Build a job from the request path segment and the optional `size`
    /// query value. An absent or empty size selects the original.
    pub fn from_request(filename: &str, size: Option<&str>) -> Result<Self, SizeError> {
        match size {
            None | Some("") => Ok(Self::original(filename)),
            Some(size) => {
                let (width, height) = parse_size(size)?;
                Ok(Self::resized(filename, width, height))
            }
        }
    }

    /// Cache file name for this job: the original name, or
    /// `<basename>_<W>x<H><ext>` for a resized variant.
    pub fn name(&self) -> String {
        if self.is_original {
            return self.original.clone();
        }

        let (stem, ext) = split_extension(&self.original);
        format!("{}_{}x{}{}", stem, self.width, self.height, ext)
    }
}

/// Split `name` into stem and extension, keeping the dot on the extension.
fn split_extension(name: &str) -> (&str, &str) {
    match name.rfind('.') {
        Some(idx) => name.split_at(idx),
        None => (name, ""),
    }
}

/// Parse a `WxH` token; both sides must be non-empty decimal digits and
/// non-zero.
pub fn parse_size(size: &str) -> Result<(u32, u32), SizeError> {
    let (w, h) = size
        .split_once('x')
        .ok_or_else(|| SizeError(size.to_string()))?;

    let parse = |part: &str| -> Result<u32, SizeError> {
        if part.is_empty() || !part.bytes().all(|b| b.is_ascii_digit()) {
            return Err(SizeError(size.to_string()));
        }
        match part.parse::<u32>() {
            Ok(0) | Err(_) => Err(SizeError(size.to_string())),
            Ok(v) => Ok(v),
        }
    };

    Ok((parse(w)?, parse(h)?))
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[error("size must be formatted as 123x123, got {0:?}")]
pub struct SizeError(pub String);
