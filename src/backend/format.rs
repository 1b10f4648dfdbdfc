//! Pixel format facts needed for scanout decisions.
//!
//! [`get_opaque`] returns the opaque twin of a format with an alpha channel:
//!
//! ```
//! # use smithay_kms::backend::format::{get_opaque, Fourcc};
//! assert_eq!(Some(Fourcc::Xrgb8888), get_opaque(Fourcc::Argb8888));
//! ```
//!
//! [`get_bpp`] and [`get_depth`] return the values legacy framebuffer
//! registration needs:
//!
//! ```
//! # use smithay_kms::backend::format::{get_bpp, get_depth, Fourcc};
//! assert_eq!(get_bpp(Fourcc::Xrgb8888), Some(32));
//! assert_eq!(get_depth(Fourcc::Xrgb8888), Some(24));
//! ```

pub use drm_fourcc::{DrmFourcc as Fourcc, DrmModifier as Modifier};

#[derive(Debug, Clone, Copy)]
struct FormatInfo {
    opaque: Option<Fourcc>,
    alpha: bool,
    bpp: u32,
    depth: u32,
}

macro_rules! format_info {
    ($($fourcc:ident => $bpp:literal / $depth:literal $(, alpha of $opaque:ident)?;)*) => {
        const fn info(fourcc: Fourcc) -> Option<FormatInfo> {
            match fourcc {
                $(Fourcc::$fourcc => Some(format_info!(@entry $bpp, $depth $(, $opaque)?)),)*
                _ => None,
            }
        }
    };
    (@entry $bpp:literal, $depth:literal, $opaque:ident) => {
        FormatInfo { opaque: Some(Fourcc::$opaque), alpha: true, bpp: $bpp, depth: $depth }
    };
    (@entry $bpp:literal, $depth:literal) => {
        FormatInfo { opaque: None, alpha: false, bpp: $bpp, depth: $depth }
    };
}

format_info! {
    Argb8888 => 32 / 32, alpha of Xrgb8888;
    Xrgb8888 => 32 / 24;
    Abgr8888 => 32 / 32, alpha of Xbgr8888;
    Xbgr8888 => 32 / 24;
    Rgba8888 => 32 / 32, alpha of Rgbx8888;
    Rgbx8888 => 32 / 24;
    Bgra8888 => 32 / 32, alpha of Bgrx8888;
    Bgrx8888 => 32 / 24;
    Argb2101010 => 32 / 32, alpha of Xrgb2101010;
    Xrgb2101010 => 32 / 30;
    Abgr2101010 => 32 / 32, alpha of Xbgr2101010;
    Xbgr2101010 => 32 / 30;
    Rgb565 => 16 / 16;
    Rgb888 => 24 / 24;
    Bgr888 => 24 / 24;
}

/// Returns the opaque alternative of a format with an alpha channel.
///
/// Formats without alpha, and unknown formats, yield `None`.
pub const fn get_opaque(fourcc: Fourcc) -> Option<Fourcc> {
    match info(fourcc) {
        Some(info) => info.opaque,
        None => None,
    }
}

/// Returns true if the format has an alpha channel
pub const fn has_alpha(fourcc: Fourcc) -> bool {
    match info(fourcc) {
        Some(info) => info.alpha,
        None => false,
    }
}

/// Returns the bits per pixel of the format
pub const fn get_bpp(fourcc: Fourcc) -> Option<u32> {
    match info(fourcc) {
        Some(info) => Some(info.bpp),
        None => None,
    }
}

/// Returns the color depth of the format, ignoring padding bits
pub const fn get_depth(fourcc: Fourcc) -> Option<u32> {
    match info(fourcc) {
        Some(info) => Some(info.depth),
        None => None,
    }
}
