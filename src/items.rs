use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Point {
    pub x: i64,
    pub y: i64,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MouseButton {
    #[serde(alias = "wheel")]
    Middle,
    Right,
    Back,
    Forward,
    /// Also what any button name outside this set decodes to.
    /// (`#[serde(other)]` must be on the last variant.)
    #[default]
    #[serde(other)]
    Left,
}

fn default_wait_ms() -> u64 {
    1000
}

/// A primitive action proposed by the model. Consumed once by the turn executor.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Action {
    Click {
        x: i64,
        y: i64,
        #[serde(default)]
        button: MouseButton,
    },
    DoubleClick { x: i64, y: i64 },
    Scroll {
        x: i64,
        y: i64,
        #[serde(default)]
        scroll_x: i64,
        #[serde(default)]
        scroll_y: i64,
    },
    Type { text: String },
    Keypress { keys: Vec<String> },
    Wait {
        #[serde(default = "default_wait_ms")]
        ms: u64,
    },
    Move { x: i64, y: i64 },
    Drag { path: Vec<Point> },
    Screenshot,
    // Backend-specific extensions
    Goto { url: String },
    Back,
    Forward,
    Exec { command: String },
    /// An action kind outside the known vocabulary; unsupported by every backend.
    Unknown { kind: String },
}

impl Action {
    pub fn kind(&self) -> &str {
        match self {
            Action::Click { .. } => "click",
            Action::DoubleClick { .. } => "double_click",
            Action::Scroll { .. } => "scroll",
            Action::Type { .. } => "type",
            Action::Keypress { .. } => "keypress",
            Action::Wait { .. } => "wait",
            Action::Move { .. } => "move",
            Action::Drag { .. } => "drag",
            Action::Screenshot => "screenshot",
            Action::Goto { .. } => "goto",
            Action::Back => "back",
            Action::Forward => "forward",
            Action::Exec { .. } => "exec",
            Action::Unknown { kind } => kind,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PendingSafetyCheck {
    pub id: String,
    #[serde(default)]
    pub code: Option<String>,
    pub message: String,
}

/// Post-execution feedback for one action.
#[derive(Clone, Debug)]
pub struct Observation {
    pub screenshot: Vec<u8>,
    /// Page address for browsers, empty for bare desktops.
    pub location: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum CallOutcome {
    Observed {
        screenshot_base64: String,
        current_url: String,
    },
    Failed { error: String },
    Rejected { message: String },
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Item {
    User {
        content: String,
    },
    Message {
        #[serde(default)]
        id: Option<String>,
        text: String,
    },
    Reasoning {
        #[serde(default)]
        id: Option<String>,
        summary: Vec<String>,
    },
    ComputerCall {
        #[serde(default)]
        id: Option<String>,
        call_id: String,
        action: Action,
        #[serde(default)]
        pending_safety_checks: Vec<PendingSafetyCheck>,
    },
    ComputerCallOutput {
        call_id: String,
        #[serde(default)]
        acknowledged_safety_checks: Vec<PendingSafetyCheck>,
        outcome: CallOutcome,
    },
}

impl Item {
    pub fn user(content: impl Into<String>) -> Self {
        Item::User { content: content.into() }
    }
}

/// Role-tagged items in order. Append-only for the lifetime of a session.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Conversation {
    items: Vec<Item>,
}

impl Conversation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, item: Item) {
        self.items.push(item);
    }

    pub fn items(&self) -> &[Item] {
        &self.items
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn last(&self) -> Option<&Item> {
        self.items.last()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn decodes_model_action_payloads() {
        let click: Action = serde_json::from_value(json!({"type": "click", "x": 10, "y": 20})).unwrap();
        assert_eq!(click, Action::Click { x: 10, y: 20, button: MouseButton::Left });

        let scroll: Action =
            serde_json::from_value(json!({"type": "scroll", "x": 5, "y": 6, "scroll_y": -3})).unwrap();
        assert_eq!(scroll, Action::Scroll { x: 5, y: 6, scroll_x: 0, scroll_y: -3 });

        let wait: Action = serde_json::from_value(json!({"type": "wait"})).unwrap();
        assert_eq!(wait, Action::Wait { ms: 1000 });

        let drag: Action = serde_json::from_value(
            json!({"type": "drag", "path": [{"x": 1, "y": 2}, {"x": 3, "y": 4}]}),
        )
        .unwrap();
        assert_eq!(drag.kind(), "drag");
    }

    #[test]
    fn wheel_and_unknown_buttons_still_click() {
        let wheel: Action =
            serde_json::from_value(json!({"type": "click", "x": 1, "y": 2, "button": "wheel"})).unwrap();
        assert_eq!(wheel, Action::Click { x: 1, y: 2, button: MouseButton::Middle });

        let odd: Action =
            serde_json::from_value(json!({"type": "click", "x": 1, "y": 2, "button": "thumb"})).unwrap();
        assert_eq!(odd, Action::Click { x: 1, y: 2, button: MouseButton::Left });
    }

    #[test]
    fn unknown_kind_reports_its_name() {
        let a = Action::Unknown { kind: "teleport".into() };
        assert_eq!(a.kind(), "teleport");
    }
}
