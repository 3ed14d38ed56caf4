pub fn detect_mime_type(data: &[u8]) -> Option<String> {
    if data.len() > 12 {
        let ftyp = &data[4..12];
        if ftyp.starts_with(b"ftyp") {
            let brand = &ftyp[4..8];
            if brand == b"heic" || brand == b"heif" || brand == b"hevc" {
                return Some("image/heic".to_string());
            }
        }
    }

    infer::get(data).map(|kind| kind.mime_type().to_string())
}

pub fn normalize_image_mime_type(mime_type: &str) -> String {
    let lowered = mime_type.trim().to_ascii_lowercase();
    match lowered.as_str() {
        "image/jpg" => "image/jpeg".to_string(),
        _ => lowered,
    }
}

// Upload types the UI accepts; the source image must also be decodable.
// All of these are valid Gemini inline-data types.
pub fn upload_supports_mime(mime_type: &str) -> bool {
    matches!(mime_type, "image/png" | "image/jpeg" | "image/webp")
}

pub fn extension_for_mime(mime_type: &str) -> &'static str {
    match mime_type {
        "image/jpeg" => "jpg",
        "image/webp" => "webp",
        "image/heic" | "image/heif" => "heic",
        _ => "png",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PNG_MAGIC: &[u8] = &[
        0x89, 0x50, 0x4E, 0x47, 0x0D, 0x0A, 0x1A, 0x0A, 0x00, 0x00, 0x00, 0x0D, 0x49, 0x48, 0x44,
        0x52,
    ];
    const JPEG_MAGIC: &[u8] = &[
        0xFF, 0xD8, 0xFF, 0xE0, 0x00, 0x10, 0x4A, 0x46, 0x49, 0x46, 0x00, 0x01, 0x01, 0x00,
    ];

    #[test]
    fn detects_png_and_jpeg_from_magic_bytes() {
        assert_eq!(detect_mime_type(PNG_MAGIC).as_deref(), Some("image/png"));
        assert_eq!(detect_mime_type(JPEG_MAGIC).as_deref(), Some("image/jpeg"));
    }

    #[test]
    fn normalizes_legacy_jpg_alias() {
        assert_eq!(normalize_image_mime_type("image/JPG"), "image/jpeg");
        assert_eq!(normalize_image_mime_type(" image/png "), "image/png");
    }

    #[test]
    fn upload_set_rejects_unsupported_types() {
        assert!(upload_supports_mime("image/png"));
        assert!(upload_supports_mime("image/webp"));
        assert!(!upload_supports_mime("image/heic"));
        assert!(!upload_supports_mime("application/pdf"));
    }

    #[test]
    fn extensions_follow_mime() {
        assert_eq!(extension_for_mime("image/jpeg"), "jpg");
        assert_eq!(extension_for_mime("image/png"), "png");
        assert_eq!(extension_for_mime("application/octet-stream"), "png");
    }
}
