//! Static action → operation class table
//!
//! Every tool action the gateway fronts is listed here with the quota class
//! it is charged against and the upstream service (and therefore circuit)
//! it calls. Lookups for anything absent fall back to
//! [`OperationClass::Write`] so an unlisted action is never accounted for
//! more cheaply than it might cost.

use std::collections::HashMap;
use std::fmt;

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};

/// Quota bucket an action is charged against
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationClass {
    Read,
    Write,
    Admin,
}

impl OperationClass {
    pub const ALL: [Self; 3] = [Self::Read, Self::Write, Self::Admin];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Read => "read",
            Self::Write => "write",
            Self::Admin => "admin",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "read" => Some(Self::Read),
            "write" => Some(Self::Write),
            "admin" => Some(Self::Admin),
            _ => None,
        }
    }

    /// Read results may be cached; nothing else may
    pub fn is_read_only(self) -> bool {
        self == Self::Read
    }
}

impl fmt::Display for OperationClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Upstream API family; each one has its own circuit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpstreamService {
    Sheets,
    Drive,
    BigQuery,
    AppsScript,
}

impl UpstreamService {
    pub const ALL: [Self; 4] = [Self::Sheets, Self::Drive, Self::BigQuery, Self::AppsScript];

    /// Circuit and connection-pool name for this service
    pub fn circuit_name(self) -> &'static str {
        match self {
            Self::Sheets => "sheets",
            Self::Drive => "drive",
            Self::BigQuery => "bigquery",
            Self::AppsScript => "apps_script",
        }
    }
}

impl fmt::Display for UpstreamService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.circuit_name())
    }
}

/// Classification of one tool action
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ActionProfile {
    pub class: OperationClass,
    pub service: UpstreamService,
    /// Whether the action was found in the table
    pub known: bool,
}

use OperationClass::{Admin, Read, Write};
use UpstreamService::{AppsScript, BigQuery, Drive, Sheets};

/// `(tool, action, class, service)` for every supported action
pub const ACTION_TABLE: &[(&str, &str, OperationClass, UpstreamService)] = &[
    // Spreadsheet lifecycle
    ("sheets_core", "get", Read, Sheets),
    ("sheets_core", "get_url", Read, Sheets),
    ("sheets_core", "list_sheets", Read, Sheets),
    ("sheets_core", "get_sheet", Read, Sheets),
    ("sheets_core", "create", Write, Sheets),
    ("sheets_core", "add_sheet", Write, Sheets),
    ("sheets_core", "delete_sheet", Write, Sheets),
    ("sheets_core", "duplicate_sheet", Write, Sheets),
    ("sheets_core", "update_sheet", Write, Sheets),
    ("sheets_core", "copy_sheet_to", Write, Sheets),
    ("sheets_core", "update_properties", Write, Sheets),
    ("sheets_core", "copy", Write, Drive),
    ("sheets_core", "list", Read, Drive),
    // Cell values
    ("sheets_data", "read", Read, Sheets),
    ("sheets_data", "batch_read", Read, Sheets),
    ("sheets_data", "find", Read, Sheets),
    ("sheets_data", "write", Write, Sheets),
    ("sheets_data", "batch_write", Write, Sheets),
    ("sheets_data", "append", Write, Sheets),
    ("sheets_data", "clear", Write, Sheets),
    ("sheets_data", "batch_clear", Write, Sheets),
    ("sheets_data", "replace", Write, Sheets),
    ("sheets_data", "add_note", Write, Sheets),
    ("sheets_data", "get_note", Read, Sheets),
    ("sheets_data", "clear_note", Write, Sheets),
    ("sheets_data", "set_hyperlink", Write, Sheets),
    ("sheets_data", "merge_cells", Write, Sheets),
    ("sheets_data", "unmerge_cells", Write, Sheets),
    ("sheets_data", "get_merges", Read, Sheets),
    ("sheets_data", "cut_paste", Write, Sheets),
    ("sheets_data", "copy_paste", Write, Sheets),
    // Formatting
    ("sheets_format", "set_format", Write, Sheets),
    ("sheets_format", "set_background", Write, Sheets),
    ("sheets_format", "set_text_format", Write, Sheets),
    ("sheets_format", "set_number_format", Write, Sheets),
    ("sheets_format", "set_alignment", Write, Sheets),
    ("sheets_format", "set_borders", Write, Sheets),
    ("sheets_format", "clear_format", Write, Sheets),
    ("sheets_format", "apply_preset", Write, Sheets),
    ("sheets_format", "auto_fit", Write, Sheets),
    ("sheets_format", "add_conditional_format", Write, Sheets),
    ("sheets_format", "list_conditional_formats", Read, Sheets),
    ("sheets_format", "delete_conditional_format", Write, Sheets),
    ("sheets_format", "set_data_validation", Write, Sheets),
    ("sheets_format", "clear_data_validation", Write, Sheets),
    ("sheets_format", "list_data_validations", Read, Sheets),
    // Rows, columns, filters
    ("sheets_dimensions", "insert_rows", Write, Sheets),
    ("sheets_dimensions", "insert_columns", Write, Sheets),
    ("sheets_dimensions", "delete_rows", Write, Sheets),
    ("sheets_dimensions", "delete_columns", Write, Sheets),
    ("sheets_dimensions", "move_rows", Write, Sheets),
    ("sheets_dimensions", "move_columns", Write, Sheets),
    ("sheets_dimensions", "resize_rows", Write, Sheets),
    ("sheets_dimensions", "resize_columns", Write, Sheets),
    ("sheets_dimensions", "hide_rows", Write, Sheets),
    ("sheets_dimensions", "show_rows", Write, Sheets),
    ("sheets_dimensions", "freeze_rows", Write, Sheets),
    ("sheets_dimensions", "freeze_columns", Write, Sheets),
    ("sheets_dimensions", "group_rows", Write, Sheets),
    ("sheets_dimensions", "ungroup_rows", Write, Sheets),
    ("sheets_dimensions", "sort_range", Write, Sheets),
    ("sheets_dimensions", "set_basic_filter", Write, Sheets),
    ("sheets_dimensions", "clear_basic_filter", Write, Sheets),
    ("sheets_dimensions", "get_basic_filter", Read, Sheets),
    ("sheets_dimensions", "create_filter_view", Write, Sheets),
    ("sheets_dimensions", "list_filter_views", Read, Sheets),
    ("sheets_dimensions", "delete_filter_view", Write, Sheets),
    // Charts and pivots
    ("sheets_visualize", "chart_create", Write, Sheets),
    ("sheets_visualize", "chart_update", Write, Sheets),
    ("sheets_visualize", "chart_delete", Write, Sheets),
    ("sheets_visualize", "chart_list", Read, Sheets),
    ("sheets_visualize", "chart_get", Read, Sheets),
    ("sheets_visualize", "chart_move", Write, Sheets),
    ("sheets_visualize", "pivot_create", Write, Sheets),
    ("sheets_visualize", "pivot_update", Write, Sheets),
    ("sheets_visualize", "pivot_delete", Write, Sheets),
    ("sheets_visualize", "pivot_get", Read, Sheets),
    // Sharing, comments, revisions
    ("sheets_collaborate", "share_add", Admin, Drive),
    ("sheets_collaborate", "share_update", Admin, Drive),
    ("sheets_collaborate", "share_remove", Admin, Drive),
    ("sheets_collaborate", "share_list", Read, Drive),
    ("sheets_collaborate", "share_transfer_ownership", Admin, Drive),
    ("sheets_collaborate", "share_set_link", Admin, Drive),
    ("sheets_collaborate", "comment_add", Write, Drive),
    ("sheets_collaborate", "comment_list", Read, Drive),
    ("sheets_collaborate", "comment_resolve", Write, Drive),
    ("sheets_collaborate", "comment_delete", Write, Drive),
    ("sheets_collaborate", "version_list_revisions", Read, Drive),
    ("sheets_collaborate", "version_get_revision", Read, Drive),
    ("sheets_collaborate", "version_restore_revision", Admin, Drive),
    ("sheets_collaborate", "version_create_snapshot", Write, Drive),
    // Named ranges, protection, metadata
    ("sheets_advanced", "add_named_range", Write, Sheets),
    ("sheets_advanced", "update_named_range", Write, Sheets),
    ("sheets_advanced", "delete_named_range", Write, Sheets),
    ("sheets_advanced", "list_named_ranges", Read, Sheets),
    ("sheets_advanced", "add_protected_range", Admin, Sheets),
    ("sheets_advanced", "update_protected_range", Admin, Sheets),
    ("sheets_advanced", "delete_protected_range", Admin, Sheets),
    ("sheets_advanced", "list_protected_ranges", Read, Sheets),
    ("sheets_advanced", "set_metadata", Write, Sheets),
    ("sheets_advanced", "get_metadata", Read, Sheets),
    ("sheets_advanced", "delete_metadata", Write, Sheets),
    ("sheets_advanced", "add_banding", Write, Sheets),
    ("sheets_advanced", "list_banding", Read, Sheets),
    // Analysis (read-only scans of sheet content)
    ("sheets_analyze", "comprehensive", Read, Sheets),
    ("sheets_analyze", "analyze_data", Read, Sheets),
    ("sheets_analyze", "analyze_structure", Read, Sheets),
    ("sheets_analyze", "analyze_formulas", Read, Sheets),
    ("sheets_analyze", "detect_patterns", Read, Sheets),
    ("sheets_analyze", "suggest_chart", Read, Sheets),
    // Data quality
    ("sheets_quality", "validate", Read, Sheets),
    ("sheets_quality", "detect_conflicts", Read, Sheets),
    ("sheets_quality", "analyze_impact", Read, Sheets),
    ("sheets_fix", "fix", Write, Sheets),
    // Operation history
    ("sheets_history", "list", Read, Sheets),
    ("sheets_history", "get", Read, Sheets),
    ("sheets_history", "stats", Read, Sheets),
    ("sheets_history", "undo", Write, Sheets),
    ("sheets_history", "redo", Write, Sheets),
    ("sheets_history", "revert_to", Write, Sheets),
    // Composite workflows
    ("sheets_composite", "import_csv", Write, Sheets),
    ("sheets_composite", "smart_append", Write, Sheets),
    ("sheets_composite", "bulk_update", Write, Sheets),
    ("sheets_composite", "deduplicate", Write, Sheets),
    ("sheets_composite", "export_csv", Read, Sheets),
    // Templates
    ("sheets_templates", "list", Read, Drive),
    ("sheets_templates", "get", Read, Drive),
    ("sheets_templates", "create", Write, Drive),
    ("sheets_templates", "apply", Write, Sheets),
    ("sheets_templates", "delete", Write, Drive),
    // Apps Script
    ("sheets_appsscript", "get_project", Read, AppsScript),
    ("sheets_appsscript", "get_content", Read, AppsScript),
    ("sheets_appsscript", "list_deployments", Read, AppsScript),
    ("sheets_appsscript", "create_project", Admin, AppsScript),
    ("sheets_appsscript", "update_content", Admin, AppsScript),
    ("sheets_appsscript", "deploy", Admin, AppsScript),
    ("sheets_appsscript", "undeploy", Admin, AppsScript),
    ("sheets_appsscript", "run", Admin, AppsScript),
    // BigQuery connected sheets
    ("sheets_bigquery", "query", Read, BigQuery),
    ("sheets_bigquery", "preview", Read, BigQuery),
    ("sheets_bigquery", "list_connections", Read, BigQuery),
    ("sheets_bigquery", "connect", Admin, BigQuery),
    ("sheets_bigquery", "disconnect", Admin, BigQuery),
    ("sheets_bigquery", "refresh", Write, BigQuery),
    ("sheets_bigquery", "export_to_bigquery", Write, BigQuery),
    ("sheets_bigquery", "import_from_bigquery", Write, BigQuery),
    // Change notifications
    ("sheets_webhook", "register", Admin, Drive),
    ("sheets_webhook", "unregister", Admin, Drive),
    ("sheets_webhook", "list", Read, Drive),
    ("sheets_webhook", "get", Read, Drive),
    // Formula dependency graph
    ("sheets_dependencies", "build", Read, Sheets),
    ("sheets_dependencies", "analyze_impact", Read, Sheets),
    ("sheets_dependencies", "detect_cycles", Read, Sheets),
];

static ACTION_INDEX: Lazy<HashMap<(&'static str, &'static str), ActionProfile>> = Lazy::new(|| {
    ACTION_TABLE
        .iter()
        .map(|&(tool, action, class, service)| {
            ((tool, action), ActionProfile { class, service, known: true })
        })
        .collect()
});

/// Look up an action, defaulting unknown actions to the write class on the
/// sheets service
pub fn classify(tool: &str, action: &str) -> ActionProfile {
    ACTION_INDEX.get(&(tool, action)).copied().unwrap_or(ActionProfile {
        class: OperationClass::Write,
        service: UpstreamService::Sheets,
        known: false,
    })
}
