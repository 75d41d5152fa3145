//! Synthetic images and option sets for pipeline and E2E tests

#![allow(dead_code)]

use image::{ImageBuffer, ImageFormat, Rgb, Rgba};
use std::io::Cursor;

use tattoo_preview::models::job::TattooOptions;

/// Body photo with a red marked placement area in the middle.
pub fn body_photo() -> Vec<u8> {
    let img = ImageBuffer::from_fn(64, 48, |x, y| {
        if (24..40).contains(&x) && (16..32).contains(&y) {
            Rgb([230u8, 20, 20])
        } else {
            Rgb([205u8, 170, 140])
        }
    });
    let mut out = Cursor::new(Vec::new());
    img.write_to(&mut out, ImageFormat::Jpeg)
        .expect("encode body photo");
    out.into_inner()
}

/// Simple black-on-transparent design.
pub fn tattoo_design() -> Vec<u8> {
    let img = ImageBuffer::from_fn(32, 32, |x, y| {
        if x == y || x + y == 31 {
            Rgba([0u8, 0, 0, 255])
        } else {
            Rgba([0u8, 0, 0, 0])
        }
    });
    png_from(img)
}

/// What a well-behaved provider hands back.
pub fn composite_result() -> Vec<u8> {
    png_from(ImageBuffer::from_pixel(64, 64, Rgba([180u8, 140, 120, 255])))
}

fn png_from(img: ImageBuffer<Rgba<u8>, Vec<u8>>) -> Vec<u8> {
    let mut out = Cursor::new(Vec::new());
    img.write_to(&mut out, ImageFormat::Png)
        .expect("encode png");
    out.into_inner()
}

/// Option sets a client may send along with the images.
pub struct OptionsFixture {
    pub name: &'static str,
    pub options: TattooOptions,
    pub valid: bool,
}

pub fn option_fixtures() -> Vec<OptionsFixture> {
    vec![
        OptionsFixture {
            name: "none",
            options: TattooOptions::default(),
            valid: true,
        },
        OptionsFixture {
            name: "styles and colors",
            options: TattooOptions {
                styles: vec!["fine line".into(), "blackwork".into()],
                colors: vec!["black".into(), "crimson".into()],
                description: "small, slightly faded".into(),
            },
            valid: true,
        },
        OptionsFixture {
            name: "too many styles",
            options: TattooOptions {
                styles: (0..12).map(|i| format!("style-{i}")).collect(),
                ..Default::default()
            },
            valid: false,
        },
        OptionsFixture {
            name: "description too long",
            options: TattooOptions {
                description: "x".repeat(501),
                ..Default::default()
            },
            valid: false,
        },
    ]
}
