//! MIME type guessing for download/preview responses.

/// Fallback MIME type when nothing more specific is known.
pub const OCTET_STREAM: &str = "application/octet-stream";

/// Guesses a MIME type from a file name's extension.
///
/// Best-effort, dependency-free guess covering the extensions a preview
/// endpoint cares about; anything unrecognized falls back to
/// [`OCTET_STREAM`].
pub fn guess_from_filename(name: &str) -> &'static str {
    let ext = name
        .rsplit_once('.')
        .map(|(_, ext)| ext.to_ascii_lowercase())
        .unwrap_or_default();

    match ext.as_str() {
        "txt" | "md" | "csv" | "log" => "text/plain",
        "html" | "htm" => "text/html",
        "json" => "application/json",
        "pdf" => "application/pdf",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "webp" => "image/webp",
        "svg" => "image/svg+xml",
        "mp4" => "video/mp4",
        "mp3" => "audio/mpeg",
        "zip" => "application/zip",
        _ => OCTET_STREAM,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_guess_known_extension() {
        assert_eq!(guess_from_filename("report.PDF"), "application/pdf");
        assert_eq!(guess_from_filename("photo.jpg"), "image/jpeg");
    }

    #[test]
    fn test_guess_unknown_falls_back() {
        assert_eq!(guess_from_filename("archive.tar.zst"), OCTET_STREAM);
        assert_eq!(guess_from_filename("no_extension"), OCTET_STREAM);
    }
}
