#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathNormalizationError {
    EmptyInput,
    EscapesRoot,
    ResolvesToRoot,
}

impl std::fmt::Display for PathNormalizationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::EmptyInput => write!(f, "path cannot be empty"),
            Self::EscapesRoot => write!(f, "path traversal escapes above the tree root"),
            Self::ResolvesToRoot => write!(f, "path resolves to the tree root and is not allowed"),
        }
    }
}

impl std::error::Error for PathNormalizationError {}

/// Canonicalize a resource path so equivalent spellings compare equal.
///
/// - trim surrounding whitespace
/// - normalize separators to '/'
/// - collapse duplicate separators
/// - resolve '.' and '..' lexically, rejecting traversal above the root
/// - keep a single leading '/' for absolute paths, drop trailing '/'
///
/// Store lookups compare the result by exact string equality.
pub fn canonical_resource_path(input: &str) -> Result<String, PathNormalizationError> {
    let input = input.trim();
    if input.is_empty() {
        return Err(PathNormalizationError::EmptyInput);
    }
    let unified = input.replace('\\', "/");
    let absolute = unified.starts_with('/');

    let mut segments: Vec<&str> = Vec::new();
    for segment in unified.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                if segments.pop().is_none() {
                    return Err(PathNormalizationError::EscapesRoot);
                }
            }
            s => segments.push(s),
        }
    }

    if segments.is_empty() {
        return Err(PathNormalizationError::ResolvesToRoot);
    }

    let joined = segments.join("/");
    if absolute {
        Ok(format!("/{joined}"))
    } else {
        Ok(joined)
    }
}
