//! Test images generated in memory

#![allow(dead_code)]

use image::{DynamicImage, ImageFormat, Rgb, RgbImage};
use std::io::Cursor;

/// An original image placed in the cache directory before a test runs
#[derive(Debug, Clone)]
pub struct TestImageFixture {
    pub filename: &'static str,
    pub width: u32,
    pub height: u32,
    pub format: ImageFormat,
    pub description: &'static str,
}

impl TestImageFixture {
    /// Encode a solid-colour image with this fixture's size and format
    pub fn bytes(&self) -> Vec<u8> {
        let img = RgbImage::from_fn(self.width, self.height, |x, y| {
            Rgb([(x % 256) as u8, (y % 256) as u8, 128])
        });
        let mut out = Cursor::new(Vec::new());
        DynamicImage::ImageRgb8(img)
            .write_to(&mut out, self.format)
            .expect("Failed to encode fixture image");
        out.into_inner()
    }
}

pub const LANDSCAPE_JPEG: TestImageFixture = TestImageFixture {
    filename: "cat.jpg",
    width: 300,
    height: 200,
    format: ImageFormat::Jpeg,
    description: "Landscape JPEG, 300x200px",
};

pub const PORTRAIT_PNG: TestImageFixture = TestImageFixture {
    filename: "tower.png",
    width: 120,
    height: 240,
    format: ImageFormat::Png,
    description: "Portrait PNG, 120x240px",
};

pub const TEST_FIXTURES: &[TestImageFixture] = &[LANDSCAPE_JPEG, PORTRAIT_PNG];
