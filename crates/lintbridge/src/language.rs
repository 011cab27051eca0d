//! Language identifiers and `file://` URIs for submitted documents.

use std::io;
use std::path::{Path, PathBuf};

use url::Url;

/// Language id for files whose extension the engine has no analyzer for.
pub const PLAINTEXT: &str = "plaintext";

const LANGUAGES: &[(&str, &[&str])] = &[
    ("html", &["htm", "html"]),
    ("javascript", &["js"]),
    ("php", &["php"]),
    ("python", &["py"]),
    ("typescript", &["ts"]),
    ("kotlin", &["kt"]),
    ("java", &["java"]),
];

/// Language id derived from the file extension (case-insensitive).
pub fn language_id(path: &Path) -> &'static str {
    let Some(ext) = path.extension().and_then(|e| e.to_str()) else {
        return PLAINTEXT;
    };
    let ext = ext.to_ascii_lowercase();
    LANGUAGES
        .iter()
        .find(|(_, extensions)| extensions.contains(&ext.as_str()))
        .map_or(PLAINTEXT, |(language, _)| language)
}

/// Percent-encoded `file://` URI for `path`, made absolute first.
pub fn to_file_uri(path: &Path) -> io::Result<String> {
    let absolute = std::path::absolute(path)?;
    path_uri(&absolute)
}

fn path_uri(absolute: &Path) -> io::Result<String> {
    Url::from_file_path(absolute).map(String::from).map_err(|()| {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("{} cannot be expressed as a file URI", absolute.display()),
        )
    })
}

/// Path named by a `file://` URI. Other strings are returned as paths unchanged.
pub fn from_file_uri(uri: &str) -> PathBuf {
    Url::parse(uri)
        .ok()
        .filter(|url| url.scheme() == "file")
        .and_then(|url| url.to_file_path().ok())
        .unwrap_or_else(|| PathBuf::from(uri))
}

/// Deepest directory containing every file, as a `file://` URI.
///
/// Returns None for an empty list or when the files share no ancestor.
pub fn common_root(files: &[PathBuf]) -> io::Result<Option<String>> {
    let mut root: Option<PathBuf> = None;
    for file in files {
        let absolute = std::path::absolute(file)?;
        let dir = absolute.parent().map(Path::to_path_buf).unwrap_or(absolute);
        root = Some(match root {
            None => dir,
            Some(current) => {
                let shared: PathBuf = current
                    .components()
                    .zip(dir.components())
                    .take_while(|(a, b)| a == b)
                    .map(|(a, _)| a)
                    .collect();
                if shared.as_os_str().is_empty() {
                    return Ok(None);
                }
                shared
            }
        });
    }
    root.map(|dir| path_uri(&dir)).transpose()
}
