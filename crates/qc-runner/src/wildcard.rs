use regex::Regex;
use std::path::{Component, Path, PathBuf};
use walkdir::WalkDir;

/// Shell-style pattern (`*`, `?`, `[...]`, `[!...]`) compiled to a regex.
#[derive(Debug, Clone)]
pub struct Wildcard {
    regex: Regex,
}

impl Wildcard {
    /// With `cross_separators`, `*` and `?` also match `/` (filename
    /// matching over stored paths); otherwise they stop at path separators.
    pub fn new(pattern: &str, cross_separators: bool) -> Result<Self, regex::Error> {
        Ok(Self {
            regex: Regex::new(&translate(pattern, cross_separators))?,
        })
    }

    pub fn is_match(&self, text: &str) -> bool {
        self.regex.is_match(text)
    }
}

fn has_wildcard(text: &str) -> bool {
    text.contains(['*', '?', '['])
}

fn translate(pattern: &str, cross_separators: bool) -> String {
    let any = if cross_separators { "." } else { "[^/]" };
    let chars: Vec<char> = pattern.chars().collect();
    let mut out = String::from("^");
    let mut i = 0;
    while i < chars.len() {
        match chars[i] {
            '*' => {
                out.push_str(any);
                out.push('*');
            }
            '?' => out.push_str(any),
            '[' => match chars[i + 1..].iter().position(|c| *c == ']') {
                Some(rel_end) if rel_end > 0 => {
                    let end = i + 1 + rel_end;
                    let mut body: String = chars[i + 1..end].iter().collect();
                    out.push('[');
                    if let Some(rest) = body.strip_prefix('!') {
                        out.push('^');
                        body = rest.to_string();
                    }
                    out.push_str(&body.replace('\\', "\\\\").replace('[', "\\["));
                    out.push(']');
                    i = end;
                }
                _ => out.push_str("\\["),
            },
            c => out.push_str(&regex::escape(&c.to_string())),
        }
        i += 1;
    }
    out.push('$');
    out
}

/// Expand a filesystem glob, returning matching paths in sorted order.
pub fn glob_paths(pattern: &str) -> Vec<String> {
    let pattern_path = Path::new(pattern);
    let components: Vec<Component<'_>> = pattern_path.components().collect();
    let split = components
        .iter()
        .position(|c| has_wildcard(&c.as_os_str().to_string_lossy()))
        .unwrap_or(components.len());
    let prefix: PathBuf = components[..split].iter().collect();
    if split == components.len() {
        return if prefix.exists() {
            vec![pattern.to_string()]
        } else {
            Vec::new()
        };
    }
    let Ok(matcher) = Wildcard::new(pattern, false) else {
        return Vec::new();
    };
    let depth = components.len() - split;
    let walk_root = if prefix.as_os_str().is_empty() {
        PathBuf::from(".")
    } else {
        prefix.clone()
    };
    let mut matches = Vec::new();
    for entry in WalkDir::new(&walk_root)
        .min_depth(depth)
        .max_depth(depth)
        .sort_by_file_name()
        .into_iter()
        .filter_map(|e| e.ok())
    {
        let Ok(rel) = entry.path().strip_prefix(&walk_root) else {
            continue;
        };
        let candidate = prefix.join(rel).to_string_lossy().to_string();
        if matcher.is_match(&candidate) {
            matches.push(candidate);
        }
    }
    matches
}
