//! Wire-format messages: `{"type", "data"}` JSON envelopes carried in
//! websocket text frames, both directions.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::interview::CodePatch;
use crate::runner::RunOutcome;

/// The envelope around every frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub data: Value,
}

impl Envelope {
    pub fn new(kind: &str, data: Value) -> Self {
        Self {
            kind: kind.to_string(),
            data,
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap()
    }
}

// ---------------------------------------------------------------------------
// Client → server payloads
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct CursorSelect {
    pub start_pos: f64,
    pub end_pos: f64,
}

#[derive(Debug, Deserialize)]
pub struct EditLang {
    pub lang: String,
}

// ---------------------------------------------------------------------------
// Server → client frames
// ---------------------------------------------------------------------------

pub fn user_joined(username: &str) -> Envelope {
    Envelope::new("user_joined", json!({ "username": username }))
}

pub fn user_left(username: &str) -> Envelope {
    Envelope::new("user_left", json!({ "username": username }))
}

/// Generic error frame; `kind` is the optional discriminator clients
/// switch on (e.g. `code_patch_error`).
pub fn error(message: &str, kind: Option<&str>) -> Envelope {
    let mut data = json!({ "message": message });
    if let Some(kind) = kind {
        data["type"] = json!(kind);
    }
    Envelope::new("error", data)
}

/// A committed patch, restamped with the server-assigned version and
/// attributed to its author.
pub fn code_patch(username: &str, patch: &CodePatch) -> Envelope {
    Envelope::new(
        "code_patch",
        json!({
            "username": username,
            "version": patch.version,
            "op": patch.op,
            "start_pos": patch.start_pos,
            "end_pos": patch.end_pos,
            "content": patch.content,
        }),
    )
}

pub fn code_res(outcome: &RunOutcome) -> Envelope {
    Envelope::new(
        "code_res",
        json!({
            "std_out": outcome.stdout,
            "std_err": outcome.stderr,
            "exit_code": outcome.exit_code,
            "error": outcome.error,
            "duration": outcome.duration,
        }),
    )
}

pub fn cursor_select(username: &str, start_pos: i64, end_pos: i64) -> Envelope {
    Envelope::new(
        "cursor_select",
        json!({
            "username": username,
            "start_pos": start_pos,
            "end_pos": end_pos,
        }),
    )
}

pub fn edit_lang(lang: &str) -> Envelope {
    Envelope::new("edit_lang", json!({ "lang": lang }))
}

/// Full state dump sent on join, on `refresh`, and to resynchronise a
/// client that lost a version race.
#[allow(clippy::too_many_arguments)]
pub fn session_init(
    session_id: &str,
    current_code: &str,
    lang: &str,
    version: i64,
    patches: &[CodePatch],
    users: &[String],
    username: &str,
) -> Envelope {
    let users: Vec<Value> = users.iter().map(|u| json!({ "username": u })).collect();
    Envelope::new(
        "session_init",
        json!({
            "session_id": session_id,
            "current_code": current_code,
            "lang": lang,
            "version": version,
            "patches": patches,
            "users": users,
            "username": username,
        }),
    )
}

/// Degraded `session_init` when the state could not be loaded.
pub fn session_init_error(session_id: &str) -> Envelope {
    Envelope::new(
        "session_init",
        json!({
            "session_id": session_id,
            "error": "Failed to load current code state",
        }),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interview::PatchOp;

    #[test]
    fn envelope_roundtrips_type_field() {
        let frame = user_joined("User7").to_json();
        let parsed: Envelope = serde_json::from_str(&frame).unwrap();
        assert_eq!(parsed.kind, "user_joined");
        assert_eq!(parsed.data["username"], "User7");
    }

    #[test]
    fn error_frame_carries_optional_discriminator() {
        let plain = error("Rate limit exceeded", None);
        assert!(plain.data.get("type").is_none());

        let tagged = error("bad patch", Some("code_patch_error"));
        assert_eq!(tagged.data["type"], "code_patch_error");
    }

    #[test]
    fn code_patch_frame_serialises_op_lowercase() {
        let patch = CodePatch {
            version: 3,
            op: PatchOp::Replace,
            start_pos: 1,
            end_pos: 2,
            content: "XY".to_string(),
        };
        let frame = code_patch("User1", &patch);
        assert_eq!(frame.data["op"], "replace");
        assert_eq!(frame.data["version"], 3);
    }

    #[test]
    fn session_init_lists_users() {
        let frame = session_init(
            "room_1",
            "print(1)",
            "python",
            4,
            &[],
            &["User1".to_string(), "User2".to_string()],
            "User2",
        );
        assert_eq!(frame.data["users"][0]["username"], "User1");
        assert_eq!(frame.data["username"], "User2");
        assert_eq!(frame.data["version"], 4);
    }
}
