#![allow(dead_code)]

use ehp::{ColorFormat, Picture, PictureDesc};
use tracing_subscriber::EnvFilter;

/// Route library logs to the test output. `RUST_LOG=ehp=debug` shows
/// pipeline traces.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}

pub fn gray(width: u32, height: u32) -> Picture {
    Picture::new(PictureDesc::new(ColorFormat::Gray8, width, height))
}

pub fn gray_filled(width: u32, height: u32, value: u8) -> Picture {
    let picture = gray(width, height);
    picture.fill(0, value);
    picture
}
