//! Game id derivation and action namespace composition.
//!
//! Every connected game is addressed by a stable id derived from its
//! reported display name. When a session has multiplexing enabled, the
//! actions it registers are exposed upstream under `<game-id>--<raw-name>`
//! so that several games can share the single upstream action namespace.

/// Separator between the game id and the raw action name in exposed names.
///
/// Derived ids can never contain two consecutive hyphens, so the separator
/// is unambiguous when splitting an exposed name back apart.
pub const ACTION_NAME_SEPARATOR: &str = "--";

/// Derive a stable game id from a display name.
///
/// Lowercases, replaces runs of whitespace with a single hyphen, deletes
/// everything outside `[a-z0-9-]`, collapses consecutive hyphens and trims
/// leading/trailing ones. The result may be empty; callers must treat an
/// empty id as inadmissible.
pub fn normalize_game_name(display_name: &str) -> String {
    let mut id = String::with_capacity(display_name.len());

    for c in display_name.to_lowercase().chars() {
        if c.is_whitespace() {
            id.push('-');
        } else if c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' {
            id.push(c);
        }
    }

    let mut collapsed = String::with_capacity(id.len());
    let mut prev_hyphen = false;
    for c in id.chars() {
        if c == '-' {
            if !prev_hyphen {
                collapsed.push('-');
            }
            prev_hyphen = true;
        } else {
            collapsed.push(c);
            prev_hyphen = false;
        }
    }

    collapsed.trim_matches('-').to_string()
}

/// Compose the upstream-visible name for a game's action.
pub fn exposed_name(game_id: &str, raw_name: &str) -> String {
    format!("{game_id}{ACTION_NAME_SEPARATOR}{raw_name}")
}

/// Strip the game id prefix from an exposed name, returning the raw name.
///
/// Returns `None` when the exposed name does not belong to `game_id`.
pub fn raw_name<'a>(game_id: &str, exposed: &'a str) -> Option<&'a str> {
    let rest = exposed.strip_prefix(game_id)?;
    rest.strip_prefix(ACTION_NAME_SEPARATOR)
}
