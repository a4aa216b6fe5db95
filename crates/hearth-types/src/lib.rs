/// Hearth shared wire types.
///
/// Everything that crosses a crate boundary or the network lives here so the
/// REST layer and the real-time gateway agree on one definition.
pub mod api;
pub mod events;
pub mod models;

/// Room a connection falls back to when an event omits one.
pub const DEFAULT_ROOM: &str = "general";

/// Lowercase, spaces to hyphens, then 2-20 characters that are each a
/// Unicode letter or digit (`char::is_alphanumeric`) or a hyphen.
/// Returns `None` when the result is not a valid room name.
pub fn normalize_room_name(raw: &str) -> Option<String> {
    let name = raw.trim().to_lowercase().replace(' ', "-");
    let len = name.chars().count();
    if !(2..=20).contains(&len) {
        return None;
    }
    if !name.chars().all(|c| c.is_alphanumeric() || c == '-') {
        return None;
    }
    Some(name)
}
