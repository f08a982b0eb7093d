//! Lexical URL-path cleanup for candidate assembly.

/// Joins path fragments with `/` and cleans the result: the output is always
/// rooted, duplicate slashes collapse, and `.`/`..` components resolve
/// without escaping the root.
pub fn clean_join<I, S>(parts: I) -> String
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let joined = parts
        .into_iter()
        .map(|p| p.as_ref().to_string())
        .collect::<Vec<_>>()
        .join("/");
    clean(&joined)
}

/// Lexically cleans a URL path, always returning a rooted path.
pub fn clean(path: &str) -> String {
    let mut stack: Vec<&str> = Vec::new();

    for component in path.split('/') {
        match component {
            "" | "." => {}
            ".." => {
                stack.pop();
            }
            name => stack.push(name),
        }
    }

    let mut out = String::with_capacity(path.len());
    for name in &stack {
        out.push('/');
        out.push_str(name);
    }

    if out.is_empty() { "/".to_string() } else { out }
}
