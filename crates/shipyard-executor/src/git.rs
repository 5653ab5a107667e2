//! Shell script that materializes a repository inside a container.

use shipyard_core::executor::GitCloneSpec;

/// Quote a value for POSIX `sh`.
pub fn shell_quote(value: &str) -> String {
    if !value.is_empty()
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./:=@+,".contains(c))
    {
        return value.to_string();
    }
    format!("'{}'", value.replace('\'', "'\\''"))
}

/// Clone URL with the access token spliced into https URLs.
fn authenticated_url(spec: &GitCloneSpec) -> String {
    match &spec.access_token {
        Some(token) if spec.url.starts_with("https://") => spec
            .url
            .replacen("https://", &format!("https://x-access-token:{}@", token), 1),
        _ => spec.url.clone(),
    }
}

/// Build the checkout script.
///
/// The repository is fetched by sha when one is known so that shallow
/// clones still land on the exact commit, otherwise by branch or ref.
pub fn clone_script(spec: &GitCloneSpec) -> String {
    let dir = shell_quote(&spec.target_dir);
    let depth = spec
        .depth
        .map(|d| format!(" --depth {}", d))
        .unwrap_or_default();
    let target = spec
        .sha
        .as_deref()
        .or(spec.branch.as_deref())
        .unwrap_or("HEAD");

    let mut lines = vec![
        "set -e".to_string(),
        format!("mkdir -p {}", dir),
        format!("cd {}", dir),
        "git init -q .".to_string(),
        format!(
            "git remote add origin {}",
            shell_quote(&authenticated_url(spec))
        ),
        format!("git fetch -q{} origin {}", depth, shell_quote(target)),
        "git checkout -q FETCH_HEAD".to_string(),
    ];

    if spec.submodules {
        lines.push(format!(
            "git submodule update -q --init --recursive{}",
            depth
        ));
    }
    if spec.lfs {
        lines.push("git lfs install --local".to_string());
        lines.push("git lfs pull".to_string());
    }
    lines.push("echo \"checked out $(git rev-parse HEAD)\"".to_string());

    lines.join("\n")
}
