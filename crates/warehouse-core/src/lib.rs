//! Core entity model, column whitelist and batch contracts for warehouse ingestion.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub type Record = Map<String, Value>;

pub const ID_COLUMN: &str = "id";
pub const CREATED_AT_COLUMN: &str = "created_at";
pub const UPDATED_AT_COLUMN: &str = "updated_at";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelationDescriptor {
    pub external_key: &'static str,
    pub internal_key: &'static str,
    pub resolver: &'static EntityDescriptor,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HistoryConfig {
    pub table: &'static str,
    pub foreign_key: &'static str,
    pub attributes: &'static [&'static str],
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntityDescriptor {
    pub entity_type: &'static str,
    pub table: &'static str,
    pub external_id_field: &'static str,
    pub attributes: &'static [&'static str],
    pub relations: &'static [RelationDescriptor],
    pub history: Option<HistoryConfig>,
}

impl EntityDescriptor {
    pub fn external_id<'a>(&self, record: &'a Record) -> Option<&'a Value> {
        match record.get(self.external_id_field)? {
            Value::Null => None,
            Value::String(s) if s.trim().is_empty() => None,
            value => Some(value),
        }
    }

    pub fn allows(&self, column: &str) -> bool {
        self.attributes.contains(&column)
    }
}

/// Canonical snake_case form of an incoming key.
///
/// `"externalProjectID"`, `"External Project-ID"` and `"external_project_id"`
/// all map to `"external_project_id"`.
pub fn normalize_key(input: &str) -> String {
    let chars: Vec<char> = input.trim().chars().collect();
    let mut out = String::with_capacity(chars.len() + 4);

    for (i, &c) in chars.iter().enumerate() {
        if c.is_ascii_alphanumeric() {
            if c.is_ascii_uppercase() && i > 0 {
                let prev = chars[i - 1];
                let next_is_lower = chars.get(i + 1).is_some_and(|n| n.is_ascii_lowercase());
                if prev.is_ascii_lowercase()
                    || prev.is_ascii_digit()
                    || (prev.is_ascii_uppercase() && next_is_lower)
                {
                    out.push('_');
                }
            }
            out.push(c.to_ascii_lowercase());
        } else if !out.is_empty() && !out.ends_with('_') {
            out.push('_');
        }
    }

    out.trim_end_matches('_').to_string()
}

pub fn normalize_keys(record: &Record) -> Record {
    let mut out = Record::new();
    for (key, value) in record {
        let canonical = normalize_key(key);
        if canonical.is_empty() {
            continue;
        }
        if canonical != *key && record.contains_key(&canonical) {
            continue;
        }
        out.insert(canonical, value.clone());
    }
    out
}

pub fn whitelist(record: &Record, attributes: &[&str]) -> Record {
    normalize_keys(record)
        .into_iter()
        .filter(|(key, _)| attributes.contains(&key.as_str()))
        .collect()
}

pub fn history_snapshot(history: &HistoryConfig, parent_id: i64, row: &Record) -> Record {
    let mut snapshot = row.clone();
    snapshot.remove(ID_COLUMN);
    snapshot.insert(history.foreign_key.to_string(), Value::from(parent_id));
    whitelist(&snapshot, history.attributes)
}

pub static PROJECT: EntityDescriptor = EntityDescriptor {
    entity_type: "project",
    table: "projects",
    external_id_field: "external_project_id",
    attributes: &[
        "id",
        "external_project_id",
        "name",
        "description",
        "status",
        "url",
        "created_at",
        "updated_at",
    ],
    relations: &[],
    history: Some(HistoryConfig {
        table: "projects_history",
        foreign_key: "project_id",
        attributes: &[
            "id",
            "project_id",
            "external_project_id",
            "name",
            "description",
            "status",
            "url",
            "created_at",
            "updated_at",
        ],
    }),
};

pub static PERSON: EntityDescriptor = EntityDescriptor {
    entity_type: "person",
    table: "persons",
    external_id_field: "external_person_id",
    attributes: &[
        "id",
        "external_person_id",
        "full_name",
        "email",
        "github_username",
        "created_at",
        "updated_at",
    ],
    relations: &[],
    history: None,
};

pub static ISSUE: EntityDescriptor = EntityDescriptor {
    entity_type: "issue",
    table: "issues",
    external_id_field: "external_issue_id",
    attributes: &[
        "id",
        "external_issue_id",
        "title",
        "state",
        "url",
        "project_id",
        "person_id",
        "created_at",
        "updated_at",
    ],
    relations: &[
        RelationDescriptor {
            external_key: "external_project_id",
            internal_key: "project_id",
            resolver: &PROJECT,
        },
        RelationDescriptor {
            external_key: "external_person_id",
            internal_key: "person_id",
            resolver: &PERSON,
        },
    ],
    history: Some(HistoryConfig {
        table: "issues_history",
        foreign_key: "issue_id",
        attributes: &[
            "id",
            "issue_id",
            "external_issue_id",
            "title",
            "state",
            "url",
            "project_id",
            "person_id",
            "created_at",
            "updated_at",
        ],
    }),
};

pub static WORK_LOG: EntityDescriptor = EntityDescriptor {
    entity_type: "work_log",
    table: "work_logs",
    external_id_field: "external_work_log_id",
    attributes: &[
        "id",
        "external_work_log_id",
        "description",
        "hours",
        "logged_on",
        "project_id",
        "person_id",
        "issue_id",
        "created_at",
        "updated_at",
    ],
    relations: &[
        RelationDescriptor {
            external_key: "external_project_id",
            internal_key: "project_id",
            resolver: &PROJECT,
        },
        RelationDescriptor {
            external_key: "external_person_id",
            internal_key: "person_id",
            resolver: &PERSON,
        },
        RelationDescriptor {
            external_key: "external_issue_id",
            internal_key: "issue_id",
            resolver: &ISSUE,
        },
    ],
    history: None,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntityKind {
    Project,
    Person,
    Issue,
    WorkLog,
}

impl EntityKind {
    pub const ALL: [EntityKind; 4] = [
        EntityKind::Project,
        EntityKind::Person,
        EntityKind::Issue,
        EntityKind::WorkLog,
    ];

    pub fn from_tag(tag: &str) -> Option<Self> {
        let tag = normalize_key(tag);
        Self::ALL
            .into_iter()
            .find(|kind| kind.descriptor().entity_type == tag)
    }

    pub fn tag(self) -> &'static str {
        self.descriptor().entity_type
    }

    pub fn descriptor(self) -> &'static EntityDescriptor {
        match self {
            EntityKind::Project => &PROJECT,
            EntityKind::Person => &PERSON,
            EntityKind::Issue => &ISSUE,
            EntityKind::WorkLog => &WORK_LOG,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Batch {
    #[serde(rename = "type")]
    pub entity_type: String,
    #[serde(default)]
    pub content: Vec<Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BatchEnvelope {
    pub data: Batch,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecuteResult {
    Success { processed: usize },
    Error { message: String },
}

impl ExecuteResult {
    pub fn is_success(&self) -> bool {
        matches!(self, ExecuteResult::Success { .. })
    }
}
