use aes_gcm::aead::{rand_core::RngCore, Aead, OsRng};
use aes_gcm::{Aes256Gcm, KeyInit, Nonce};
use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine;
use chrono::{Datelike, Months, NaiveDate, Utc};
use pbkdf2::pbkdf2_hmac;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::json;
use sha2::Sha256;
use std::collections::BTreeMap;
use std::env;
use std::fs;
use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::sync::Mutex;

const INSTITUTIONS_KEY: &str = "waqf_institutions";
const INDICATORS_KEY: &str = "waqf_indicators";
const EVALUATIONS_KEY: &str = "waqf_evaluations";
const RESPONSES_KEY: &str = "waqf_responses";
const COMPLIANCE_KEY: &str = "waqf_compliance";
const RISKS_KEY: &str = "waqf_risks";
const IMPROVEMENTS_KEY: &str = "waqf_improvements";
const SETTINGS_KEY: &str = "waqf_settings";
const SESSION_KEY: &str = "waqf_user";
const ALL_STORE_KEYS: [&str; 9] = [
    INSTITUTIONS_KEY,
    INDICATORS_KEY,
    EVALUATIONS_KEY,
    RESPONSES_KEY,
    COMPLIANCE_KEY,
    RISKS_KEY,
    IMPROVEMENTS_KEY,
    SETTINGS_KEY,
    SESSION_KEY,
];

const DEFAULT_PBKDF2_ITERATIONS: u32 = 200_000;

// Sheet imports accept two header spellings for the question column.
const SHEET_AXIS_HEADER: &str = "Axis";
const SHEET_TEXT_HEADERS: [&str; 2] = ["Question", "Indicator"];
const SHEET_DEFAULT_AXIS: &str = "General";

const WEAK_SCORE_THRESHOLD: f64 = 3.5;
const HIGH_PRIORITY_THRESHOLD: f64 = 2.5;
const IMPROVEMENT_DUE_MONTHS: u32 = 3;
const IMPROVEMENT_OWNER: &str = "Executive management";
const IMPROVEMENT_ACTION: &str =
    "Review the related policies and procedures and set a corrective plan.";

const CAPITAL_SMALL_LIMIT_OMR: f64 = 100_000.0;
const CAPITAL_MEDIUM_LIMIT_OMR: f64 = 1_000_000.0;

const AXIS_SHARIA: &str = "Sharia compliance";
const AXIS_ADMIN: &str = "Administrative and financial procedures";
const AXIS_GOVERNANCE: &str = "Governance";
const AXIS_INNOVATION: &str = "Innovation and development";
const AXIS_SUSTAINABILITY: &str = "Sustainability";

const OMAN_WILAYATS: [(&str, &[&str]); 11] = [
    (
        "Muscat",
        &["Muscat", "As Seeb", "Muttrah", "Bawshar", "Al Amarat", "Qurayyat"],
    ),
    (
        "Dhofar",
        &[
            "Salalah",
            "Taqah",
            "Mirbat",
            "Rakhyut",
            "Thumrait",
            "Dhalkut",
            "Al Mazyunah",
            "Muqshin",
            "Shalim and the Hallaniyat Islands",
            "Sadah",
        ],
    ),
    ("Musandam", &["Khasab", "Dibba", "Bukha", "Madha"]),
    ("Al Buraimi", &["Al Buraimi", "Mahdah", "As Sunaynah"]),
    (
        "Ad Dakhiliyah",
        &[
            "Nizwa",
            "Bahla",
            "Manah",
            "Al Hamra",
            "Adam",
            "Izki",
            "Samail",
            "Bidbid",
            "Al Jabal Al Akhdar",
        ],
    ),
    (
        "North Al Batinah",
        &["Sohar", "Shinas", "Liwa", "Saham", "Al Khaburah", "As Suwayq"],
    ),
    (
        "South Al Batinah",
        &[
            "Ar Rustaq",
            "Al Awabi",
            "Nakhal",
            "Wadi Al Maawil",
            "Barka",
            "Al Musannah",
        ],
    ),
    ("Ad Dhahirah", &["Ibri", "Yanqul", "Dank"]),
    (
        "South Ash Sharqiyah",
        &[
            "Sur",
            "Al Kamil Wal Wafi",
            "Jalan Bani Bu Hassan",
            "Jalan Bani Bu Ali",
            "Masirah",
        ],
    ),
    (
        "North Ash Sharqiyah",
        &[
            "Ibra",
            "Al Mudaybi",
            "Bidiyah",
            "Al Qabil",
            "Wadi Bani Khalid",
            "Dima Wat Tayeen",
            "Sinaw",
        ],
    ),
    ("Al Wusta", &["Haima", "Mahout", "Ad Duqm", "Al Jazer"]),
];

fn wilayats_for(governorate: &str) -> Option<&'static [&'static str]> {
    OMAN_WILAYATS
        .iter()
        .find(|(name, _)| *name == governorate)
        .map(|(_, wilayats)| *wilayats)
}

fn seed_indicator(id: &str, axis: &str, text: &str) -> Indicator {
    Indicator {
        id: id.to_string(),
        axis: axis.to_string(),
        text: text.to_string(),
        weight: 1.0,
        active: true,
    }
}

fn default_indicators() -> Vec<Indicator> {
    vec![
        seed_indicator(
            "SH-01",
            AXIS_SHARIA,
            "Is the endowment yield spent on the purposes set by the endowers?",
        ),
        seed_indicator(
            "SH-02",
            AXIS_SHARIA,
            "Are the endowment conditions fully respected, with changes made only under a formal religious ruling?",
        ),
        seed_indicator(
            "SH-03",
            AXIS_SHARIA,
            "Are the endowment assets preserved and maintained for future generations?",
        ),
        seed_indicator(
            "SH-04",
            AXIS_SHARIA,
            "Is there independent sharia oversight over all transactions?",
        ),
        seed_indicator(
            "SH-05",
            AXIS_SHARIA,
            "Does the institution avoid transactions that are not sharia compliant?",
        ),
        seed_indicator(
            "SH-06",
            AXIS_SHARIA,
            "Are independent periodic sharia reports issued?",
        ),
        seed_indicator(
            "AD-01",
            AXIS_ADMIN,
            "Is there a strategic plan covering the institution's vision, mission and objectives with a set timeline?",
        ),
        seed_indicator(
            "AD-02",
            AXIS_ADMIN,
            "Are there clear measurement indicators tied to the projects of the plan?",
        ),
        seed_indicator(
            "AD-03",
            AXIS_ADMIN,
            "Are internal bylaws and work procedure manuals in place?",
        ),
        seed_indicator(
            "AD-04",
            AXIS_ADMIN,
            "Are projects executed according to the approved mechanisms and within the planned schedule?",
        ),
        seed_indicator(
            "AD-05",
            AXIS_ADMIN,
            "Is there an approved human resources policy covering hiring, promotions, incentives and end of service?",
        ),
        seed_indicator(
            "AD-06",
            AXIS_ADMIN,
            "Does every employee have a job description defining the duties and responsibilities of the role?",
        ),
        seed_indicator(
            "AD-07",
            AXIS_ADMIN,
            "Is an objective employee performance appraisal system applied?",
        ),
        seed_indicator(
            "AD-08",
            AXIS_ADMIN,
            "Is there an annual training plan to develop employee skills?",
        ),
        seed_indicator(
            "AD-09",
            AXIS_ADMIN,
            "Is there an approved annual operating and capital budget?",
        ),
        seed_indicator(
            "AD-10",
            AXIS_ADMIN,
            "Is there an approved disbursement mechanism following the board's delegations?",
        ),
        seed_indicator(
            "GOV-01",
            AXIS_GOVERNANCE,
            "Has an accredited external audit office been appointed?",
        ),
        seed_indicator(
            "GOV-02",
            AXIS_GOVERNANCE,
            "Are the financial statements issued on time and disclosed?",
        ),
        seed_indicator(
            "GOV-03",
            AXIS_GOVERNANCE,
            "Are there internal procedures for monitoring revenues and expenditures?",
        ),
        seed_indicator(
            "GOV-04",
            AXIS_GOVERNANCE,
            "Is there a mechanism to reduce unnecessary expenses?",
        ),
        seed_indicator(
            "GOV-05",
            AXIS_GOVERNANCE,
            "Is there an effective system for collecting rents and returns?",
        ),
        seed_indicator(
            "GOV-06",
            AXIS_GOVERNANCE,
            "Has a reserve share of the capital been set aside?",
        ),
        seed_indicator(
            "GOV-07",
            AXIS_GOVERNANCE,
            "Is there an investment policy covering objectives, sharia controls and appraisal criteria?",
        ),
        seed_indicator(
            "INV-01",
            AXIS_INNOVATION,
            "Are new ideas from employees and beneficiaries encouraged?",
        ),
        seed_indicator(
            "INV-02",
            AXIS_INNOVATION,
            "Is innovation embedded in the institution's objectives and strategic plans?",
        ),
        seed_indicator(
            "INV-03",
            AXIS_INNOVATION,
            "Are services offered online or through digital applications?",
        ),
        seed_indicator(
            "SUS-01",
            AXIS_SUSTAINABILITY,
            "Does the institution rely on diversified revenue sources such as donations and investment?",
        ),
        seed_indicator(
            "SUS-02",
            AXIS_SUSTAINABILITY,
            "How effectively does the institution manage its resources?",
        ),
        seed_indicator(
            "SUS-03",
            AXIS_SUSTAINABILITY,
            "What is the long-term impact of the institution's projects on beneficiary communities?",
        ),
        seed_indicator(
            "SUS-04",
            AXIS_SUSTAINABILITY,
            "Does the institution enable local communities through education, health and development programs?",
        ),
    ]
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
enum InstitutionKind {
    #[default]
    General,
    Private,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
struct DocumentRef {
    id: String,
    name: String,
    mime_type: String,
    size: String,
    upload_date: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
struct Institution {
    id: String,
    name: String,
    #[serde(rename = "type")]
    kind: InstitutionKind,
    capital_omr: f64,
    employees_omani: i64,
    employees_non_omani: i64,
    #[serde(default)]
    contact_phone: String,
    #[serde(default)]
    email: String,
    #[serde(default)]
    governorate: String,
    #[serde(default)]
    wilayat: String,
    #[serde(default)]
    establishment_date: String,
    #[serde(default)]
    license_number: String,
    #[serde(default)]
    manager_name: String,
    #[serde(default)]
    notes: String,
    #[serde(default)]
    documents: Vec<DocumentRef>,
    created_at: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
struct Indicator {
    id: String,
    axis: String,
    text: String,
    weight: f64,
    active: bool,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
enum EvaluationStatus {
    #[default]
    Draft,
    Final,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
struct Evaluation {
    id: String,
    institution_id: String,
    cycle_year: i32,
    cycle_date: String,
    #[serde(default)]
    evaluator_name: String,
    status: EvaluationStatus,
    #[serde(default)]
    attachments: Vec<DocumentRef>,
    created_at: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
struct Response {
    id: String,
    evaluation_id: String,
    indicator_id: String,
    score: f64,
    #[serde(default)]
    evidence_text: String,
    updated_at: String,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
enum InstitutionStatus {
    #[default]
    Active,
    Inactive,
    InLiquidation,
    Suspended,
    Other,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
enum BoardStatus {
    #[default]
    Current,
    Expired,
    Absent,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
struct CustomRequirement {
    id: String,
    text: String,
    met: bool,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
struct ComplianceRecord {
    id: String,
    institution_id: String,
    cycle_year: i32,
    institution_status: InstitutionStatus,
    board_status: BoardStatus,
    #[serde(default)]
    board_end_date: String,
    has_executive_management: bool,
    has_auditor_company: bool,
    has_minutes_prev_year: bool,
    has_financial_report_prev_year: bool,
    #[serde(default)]
    custom_requirements: Vec<CustomRequirement>,
    #[serde(default)]
    followup_actions: String,
    #[serde(default)]
    notes: String,
    last_updated_at: String,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
enum RiskCategory {
    Strategic,
    Financial,
    #[default]
    Operational,
    Legal,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
enum RiskStatus {
    #[default]
    Open,
    Mitigated,
    Closed,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
struct RiskRegisterItem {
    id: String,
    institution_id: String,
    risk_title: String,
    category: RiskCategory,
    probability: i64,
    impact: i64,
    #[serde(default)]
    mitigation_plan: String,
    status: RiskStatus,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
enum Priority {
    High,
    Medium,
    Low,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
enum ImprovementStatus {
    #[default]
    Todo,
    Doing,
    Done,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
struct ImprovementItem {
    id: String,
    evaluation_id: String,
    indicator_id: String,
    priority: Priority,
    issue_summary: String,
    recommended_action: String,
    owner: String,
    due_date: String,
    status: ImprovementStatus,
    #[serde(default)]
    notes: String,
}

fn default_org_name() -> String {
    "Ministry of Endowments and Religious Affairs".to_string()
}

fn default_supervisor_name() -> String {
    "General Supervisor".to_string()
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
struct Settings {
    #[serde(default = "default_org_name")]
    org_name: String,
    #[serde(default = "default_supervisor_name")]
    supervisor_name: String,
    #[serde(default)]
    dark_mode: bool,
}

impl Default for Settings {
    fn default() -> Settings {
        Settings {
            org_name: default_org_name(),
            supervisor_name: default_supervisor_name(),
            dark_mode: false,
        }
    }
}

#[derive(Serialize, Deserialize)]
struct CryptoEnvelope {
    v: u8,
    salt: String,
    iv: String,
    tag: String,
    data: String,
}

trait StoredRecord: Serialize + DeserializeOwned + Clone {
    const KEY: &'static str;

    fn record_id(&self) -> &str;
}

impl StoredRecord for Institution {
    const KEY: &'static str = INSTITUTIONS_KEY;

    fn record_id(&self) -> &str {
        self.id.as_str()
    }
}

impl StoredRecord for Indicator {
    const KEY: &'static str = INDICATORS_KEY;

    fn record_id(&self) -> &str {
        self.id.as_str()
    }
}

impl StoredRecord for Evaluation {
    const KEY: &'static str = EVALUATIONS_KEY;

    fn record_id(&self) -> &str {
        self.id.as_str()
    }
}

impl StoredRecord for Response {
    const KEY: &'static str = RESPONSES_KEY;

    fn record_id(&self) -> &str {
        self.id.as_str()
    }
}

impl StoredRecord for ComplianceRecord {
    const KEY: &'static str = COMPLIANCE_KEY;

    fn record_id(&self) -> &str {
        self.id.as_str()
    }
}

impl StoredRecord for RiskRegisterItem {
    const KEY: &'static str = RISKS_KEY;

    fn record_id(&self) -> &str {
        self.id.as_str()
    }
}

impl StoredRecord for ImprovementItem {
    const KEY: &'static str = IMPROVEMENTS_KEY;

    fn record_id(&self) -> &str {
        self.id.as_str()
    }
}

/// Additive risk score over a compliance record, bounded in [0, 13].
/// Recomputed on every form change, so it must stay pure and cheap.
fn compliance_risk_score(record: &ComplianceRecord) -> (i64, &'static str) {
    let mut score = 0;
    if matches!(record.board_status, BoardStatus::Expired | BoardStatus::Absent) {
        score += 3;
    }
    if !record.has_executive_management {
        score += 2;
    }
    if !record.has_auditor_company {
        score += 2;
    }
    if !record.has_financial_report_prev_year {
        score += 2;
    }
    if !record.has_minutes_prev_year {
        score += 1;
    }
    if record.institution_status != InstitutionStatus::Active {
        score += 3;
    }
    (score, compliance_risk_label(score))
}

fn compliance_risk_label(score: i64) -> &'static str {
    if score >= 9 {
        "Critical"
    } else if score >= 6 {
        "High"
    } else if score >= 3 {
        "Medium"
    } else {
        "Low"
    }
}

fn risk_severity(probability: i64, impact: i64) -> i64 {
    probability * impact
}

fn risk_tier(severity: i64) -> &'static str {
    if severity >= 15 {
        "High"
    } else if severity >= 8 {
        "Medium"
    } else {
        "Low"
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
struct RiskMatrixCounts {
    high: usize,
    medium: usize,
    low: usize,
    total: usize,
}

fn risk_matrix_counts(risks: &[RiskRegisterItem]) -> RiskMatrixCounts {
    let mut counts = RiskMatrixCounts::default();
    for risk in risks {
        counts.total += 1;
        match risk_tier(risk_severity(risk.probability, risk.impact)) {
            "High" => counts.high += 1,
            "Medium" => counts.medium += 1,
            _ => counts.low += 1,
        }
    }
    counts
}

/// Derives improvement items for responses scored below the weak threshold.
/// Indicators already covered by an existing item for the evaluation are
/// skipped, as are responses whose indicator no longer exists in the catalog.
/// Items are never retired when a score later improves.
fn derive_improvement_items(
    evaluation_id: &str,
    responses: &[Response],
    indicators: &[Indicator],
    existing: &[ImprovementItem],
    generated_on: NaiveDate,
) -> Vec<ImprovementItem> {
    let due_date = generated_on
        .checked_add_months(Months::new(IMPROVEMENT_DUE_MONTHS))
        .unwrap_or(generated_on)
        .format("%Y-%m-%d")
        .to_string();

    let mut out: Vec<ImprovementItem> = Vec::new();
    for response in responses {
        if response.evaluation_id != evaluation_id {
            continue;
        }
        if response.score >= WEAK_SCORE_THRESHOLD {
            continue;
        }
        let covered = existing
            .iter()
            .chain(out.iter())
            .any(|item| item.indicator_id == response.indicator_id);
        if covered {
            continue;
        }
        let Some(indicator) = indicators
            .iter()
            .find(|indicator| indicator.id == response.indicator_id)
        else {
            continue;
        };
        let priority = if response.score < HIGH_PRIORITY_THRESHOLD {
            Priority::High
        } else {
            Priority::Medium
        };
        out.push(ImprovementItem {
            id: new_id(),
            evaluation_id: evaluation_id.to_string(),
            indicator_id: indicator.id.clone(),
            priority,
            issue_summary: format!("Low score on indicator: {}", indicator.text),
            recommended_action: IMPROVEMENT_ACTION.to_string(),
            owner: IMPROVEMENT_OWNER.to_string(),
            due_date: due_date.clone(),
            status: ImprovementStatus::Todo,
            notes: String::new(),
        });
    }
    out
}

/// Maps header-keyed rows from the first worksheet to a fresh indicator
/// catalog. Rows without question text are discarded.
fn map_sheet_rows(rows: &[serde_json::Value]) -> Vec<Indicator> {
    let mut out: Vec<Indicator> = Vec::new();
    for row in rows {
        let text = SHEET_TEXT_HEADERS
            .iter()
            .find_map(|header| nonempty_string(row.get(*header)))
            .map(|text| clamp_string(text.as_str(), 500, true))
            .unwrap_or_default();
        if text.is_empty() {
            continue;
        }
        let axis = nonempty_string(row.get(SHEET_AXIS_HEADER))
            .map(|axis| clamp_string(axis.as_str(), 120, true))
            .filter(|axis| !axis.is_empty())
            .unwrap_or_else(|| SHEET_DEFAULT_AXIS.to_string());
        out.push(Indicator {
            id: format!("IND-{}", out.len() + 1),
            axis,
            text,
            weight: 1.0,
            active: true,
        });
    }
    out
}

fn resolve_route(path: &str, authenticated: bool) -> &'static str {
    if !authenticated {
        return "login";
    }
    let trimmed = path.trim().trim_start_matches('#').trim_matches('/');
    match trimmed {
        "" | "dashboard" => "dashboard",
        "institutions" => "institutions",
        "evaluation" => "evaluation",
        "compliance" => "compliance",
        "reports" | "improvements" => "reports",
        "settings" => "settings",
        _ => "dashboard",
    }
}

type SettingsListener = Box<dyn Fn(&Settings) + Send + Sync>;

/// File-backed record store. Each collection lives in its own JSON file
/// under the storage root, named by its storage key. Reads and writes are
/// whole-collection and synchronous; the last writer wins.
struct Store {
    root: PathBuf,
    settings_listeners: Mutex<Vec<SettingsListener>>,
}

impl Store {
    fn open(root: PathBuf) -> Result<Store, String> {
        fs::create_dir_all(root.as_path()).map_err(|err| err.to_string())?;
        Ok(Store {
            root,
            settings_listeners: Mutex::new(Vec::new()),
        })
    }

    fn key_path(&self, key: &str) -> PathBuf {
        self.root.join(format!("{key}.json"))
    }

    fn read_raw(&self, key: &str) -> Result<Option<String>, String> {
        let path = self.key_path(key);
        if !path.exists() {
            return Ok(None);
        }
        let data = fs::read_to_string(path).map_err(|err| err.to_string())?;
        Ok(Some(data))
    }

    fn write_raw(&self, key: &str, content: &str) -> Result<(), String> {
        write_text_file(self.key_path(key), content)
    }

    fn remove_key(&self, key: &str) -> Result<(), String> {
        let path = self.key_path(key);
        if path.exists() {
            fs::remove_file(path).map_err(|err| err.to_string())?;
        }
        Ok(())
    }

    fn list<T: StoredRecord>(&self) -> Result<Vec<T>, String> {
        let Some(raw) = self.read_raw(T::KEY)? else {
            return Ok(Vec::new());
        };
        // Corrupt collections read as empty rather than failing the caller.
        match serde_json::from_str::<Vec<T>>(raw.as_str()) {
            Ok(items) => Ok(items),
            Err(_) => Ok(Vec::new()),
        }
    }

    fn write_all<T: StoredRecord>(&self, items: &[T]) -> Result<(), String> {
        let content = serde_json::to_string(items).map_err(|err| err.to_string())?;
        self.write_raw(T::KEY, content.as_str())
    }

    fn upsert<T: StoredRecord>(&self, record: T) -> Result<T, String> {
        let mut items = self.list::<T>()?;
        match items
            .iter()
            .position(|existing| existing.record_id() == record.record_id())
        {
            Some(index) => items[index] = record.clone(),
            None => items.push(record.clone()),
        }
        self.write_all(items.as_slice())?;
        Ok(record)
    }

    fn delete<T: StoredRecord>(&self, id: &str) -> Result<bool, String> {
        let mut items = self.list::<T>()?;
        let before = items.len();
        items.retain(|item| item.record_id() != id);
        if items.len() == before {
            return Ok(false);
        }
        self.write_all(items.as_slice())?;
        Ok(true)
    }

    fn settings(&self) -> Result<Settings, String> {
        let Some(raw) = self.read_raw(SETTINGS_KEY)? else {
            return Ok(Settings::default());
        };
        match serde_json::from_str::<Settings>(raw.as_str()) {
            Ok(settings) => Ok(settings),
            Err(_) => Ok(Settings::default()),
        }
    }

    fn save_settings(&self, settings: &Settings) -> Result<(), String> {
        let content = serde_json::to_string(settings).map_err(|err| err.to_string())?;
        self.write_raw(SETTINGS_KEY, content.as_str())?;
        if let Ok(listeners) = self.settings_listeners.lock() {
            for listener in listeners.iter() {
                listener(settings);
            }
        }
        Ok(())
    }

    fn on_settings_changed(&self, listener: SettingsListener) {
        if let Ok(mut listeners) = self.settings_listeners.lock() {
            listeners.push(listener);
        }
    }

    fn session_user(&self) -> Result<Option<String>, String> {
        let Some(raw) = self.read_raw(SESSION_KEY)? else {
            return Ok(None);
        };
        let user = raw.trim().to_string();
        if user.is_empty() {
            return Ok(None);
        }
        Ok(Some(user))
    }

    fn set_session_user(&self, username: &str) -> Result<(), String> {
        self.write_raw(SESSION_KEY, username)
    }

    fn clear_session(&self) -> Result<(), String> {
        self.remove_key(SESSION_KEY)
    }

    fn export_backup(&self) -> Result<serde_json::Map<String, serde_json::Value>, String> {
        let mut out = serde_json::Map::new();
        for key in ALL_STORE_KEYS {
            if let Some(raw) = self.read_raw(key)? {
                out.insert(key.to_string(), json!(raw));
            }
        }
        Ok(out)
    }

    fn import_backup(&self, data: &str) -> Result<usize, String> {
        let parsed: serde_json::Value = serde_json::from_str(data)
            .map_err(|_| "Backup file is not valid JSON.".to_string())?;
        let Some(entries) = parsed.as_object() else {
            return Err("Backup file is not a flat key-value map.".to_string());
        };
        // Validate the whole document before touching storage so a broken
        // backup leaves prior state unchanged.
        for (key, value) in entries {
            if !valid_store_key(key.as_str()) {
                return Err(format!("Backup contains an invalid storage key: {key}"));
            }
            if !value.is_string() {
                return Err("Backup file is not a flat key-value map.".to_string());
            }
        }
        let mut written = 0;
        for (key, value) in entries {
            let Some(text) = value.as_str() else {
                continue;
            };
            self.write_raw(key.as_str(), text)?;
            written += 1;
        }
        Ok(written)
    }

    fn clear_all(&self) -> Result<(), String> {
        for key in ALL_STORE_KEYS {
            self.remove_key(key)?;
        }
        Ok(())
    }
}

fn valid_store_key(key: &str) -> bool {
    !key.is_empty()
        && key.len() <= 64
        && key
            .chars()
            .all(|ch| ch.is_ascii_alphanumeric() || ch == '_' || ch == '-')
}

fn encrypt_text_with_key(
    text: &str,
    salt: &[u8],
    key: &[u8; 32],
) -> Result<CryptoEnvelope, String> {
    let mut iv = [0u8; 12];
    OsRng.fill_bytes(&mut iv);
    let cipher = Aes256Gcm::new_from_slice(key.as_slice()).map_err(|err| err.to_string())?;
    let nonce = Nonce::from_slice(&iv);
    let encrypted = cipher
        .encrypt(nonce, text.as_bytes())
        .map_err(|err| err.to_string())?;

    if encrypted.len() < 16 {
        return Err("Encryption output too short.".to_string());
    }
    let split_at = encrypted.len() - 16;
    let (data, tag) = encrypted.split_at(split_at);

    Ok(CryptoEnvelope {
        v: 1,
        salt: encode_b64(salt),
        iv: encode_b64(&iv),
        tag: encode_b64(tag),
        data: encode_b64(data),
    })
}

fn encrypt_text(text: &str, password: &str) -> Result<CryptoEnvelope, String> {
    let mut salt = [0u8; 16];
    OsRng.fill_bytes(&mut salt);

    let key = derive_key(password, &salt, DEFAULT_PBKDF2_ITERATIONS);
    encrypt_text_with_key(text, &salt, &key)
}

fn decrypt_envelope(payload: &CryptoEnvelope, password: &str) -> Result<Option<String>, String> {
    let salt = match decode_b64(payload.salt.as_str()) {
        Ok(value) if !value.is_empty() => value,
        _ => return Ok(None),
    };
    let iv = match decode_b64(payload.iv.as_str()) {
        Ok(value) => value,
        Err(_) => return Ok(None),
    };
    let tag = match decode_b64(payload.tag.as_str()) {
        Ok(value) => value,
        Err(_) => return Ok(None),
    };
    let data = match decode_b64(payload.data.as_str()) {
        Ok(value) => value,
        Err(_) => return Ok(None),
    };
    if iv.len() != 12 || tag.is_empty() || data.is_empty() {
        return Ok(None);
    }

    let key = derive_key(password, salt.as_slice(), DEFAULT_PBKDF2_ITERATIONS);
    let cipher = Aes256Gcm::new_from_slice(key.as_slice()).map_err(|err| err.to_string())?;
    let nonce = Nonce::from_slice(iv.as_slice());
    let mut combined = Vec::with_capacity(data.len() + tag.len());
    combined.extend_from_slice(data.as_slice());
    combined.extend_from_slice(tag.as_slice());

    let decrypted = match cipher.decrypt(nonce, combined.as_slice()) {
        Ok(value) => value,
        Err(_) => return Ok(None),
    };

    match String::from_utf8(decrypted) {
        Ok(text) => Ok(Some(text)),
        Err(_) => Ok(None),
    }
}

fn derive_key(password: &str, salt: &[u8], iterations: u32) -> [u8; 32] {
    let mut key = [0u8; 32];
    pbkdf2_hmac::<Sha256>(password.as_bytes(), salt, iterations, &mut key);
    key
}

fn decode_b64(value: &str) -> Result<Vec<u8>, String> {
    B64.decode(value).map_err(|err| err.to_string())
}

fn encode_b64(bytes: &[u8]) -> String {
    B64.encode(bytes)
}

fn write_text_file(path: PathBuf, content: &str) -> Result<(), String> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|err| err.to_string())?;
    }
    fs::write(path, content).map_err(|err| err.to_string())?;
    Ok(())
}

fn now_rfc3339() -> String {
    Utc::now().to_rfc3339()
}

fn today() -> NaiveDate {
    Utc::now().date_naive()
}

fn today_string() -> String {
    today().format("%Y-%m-%d").to_string()
}

fn current_cycle_year() -> i32 {
    Utc::now().year()
}

fn short_hex(byte_len: usize) -> String {
    let mut bytes = vec![0_u8; byte_len];
    OsRng.fill_bytes(&mut bytes);
    let mut hex = String::new();
    for b in bytes {
        hex.push_str(format!("{b:02x}").as_str());
    }
    hex
}

fn new_id() -> String {
    format!("id-{}-{}", Utc::now().timestamp_millis(), short_hex(10))
}

fn nonempty_string(value: Option<&serde_json::Value>) -> Option<String> {
    let value = value?;
    if value.is_null() {
        return None;
    }
    if let Some(text) = value.as_str() {
        if text.trim().is_empty() {
            return None;
        }
        return Some(text.to_string());
    }
    if let Some(number) = value.as_i64() {
        return Some(number.to_string());
    }
    if let Some(number) = value.as_u64() {
        return Some(number.to_string());
    }
    if let Some(number) = value.as_f64() {
        return Some(number.to_string());
    }
    if let Some(boolean) = value.as_bool() {
        return Some(boolean.to_string());
    }
    None
}

fn clamp_string(value: &str, max_len: usize, trim: bool) -> String {
    let mut out = if trim {
        value.trim().to_string()
    } else {
        value.to_string()
    };
    out = out
        .chars()
        .filter(|ch| {
            let code = *ch as u32;
            code >= 32 && code != 127
        })
        .collect();
    if out.chars().count() > max_len {
        out = out.chars().take(max_len).collect();
    }
    out
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

fn document_ref(file_name: &str, mime_type: &str, size_bytes: f64) -> DocumentRef {
    DocumentRef {
        id: new_id(),
        name: clamp_string(file_name, 255, true),
        mime_type: clamp_string(mime_type, 100, true),
        size: format!("{:.1} KB", size_bytes.max(0.0) / 1024.0),
        upload_date: today_string(),
    }
}

#[derive(Deserialize)]
struct LoginRequest {
    username: String,
}

#[derive(Serialize)]
struct SessionInfo {
    user: Option<String>,
    authenticated: bool,
}

#[derive(Deserialize)]
struct RouteRequest {
    path: String,
}

#[derive(Deserialize)]
struct InstitutionDraft {
    #[serde(default)]
    id: String,
    #[serde(default)]
    name: String,
    #[serde(default, rename = "type")]
    kind: InstitutionKind,
    #[serde(default)]
    capital_omr: f64,
    #[serde(default)]
    employees_omani: i64,
    #[serde(default)]
    employees_non_omani: i64,
    #[serde(default)]
    contact_phone: String,
    #[serde(default)]
    email: String,
    #[serde(default)]
    governorate: String,
    #[serde(default)]
    wilayat: String,
    #[serde(default)]
    establishment_date: String,
    #[serde(default)]
    license_number: String,
    #[serde(default)]
    manager_name: String,
    #[serde(default)]
    notes: String,
    #[serde(default)]
    documents: Option<Vec<DocumentRef>>,
    #[serde(default)]
    created_at: String,
}

#[derive(Deserialize)]
struct DeleteRequest {
    id: String,
}

#[derive(Deserialize)]
struct InstitutionAttachRequest {
    institution_id: String,
    file_name: String,
    #[serde(default)]
    mime_type: String,
    #[serde(default)]
    size_bytes: f64,
}

#[derive(Deserialize)]
struct InstitutionDetachRequest {
    institution_id: String,
    document_id: String,
}

#[derive(Deserialize)]
struct IndicatorAddRequest {
    #[serde(default)]
    axis: String,
    #[serde(default)]
    text: String,
}

#[derive(Deserialize)]
struct IndicatorsReplaceRequest {
    indicators: Vec<Indicator>,
}

#[derive(Deserialize)]
struct SheetImportRequest {
    rows: Vec<serde_json::Value>,
}

#[derive(Deserialize)]
struct EvaluationOpenRequest {
    institution_id: String,
    #[serde(default)]
    cycle_year: Option<i32>,
}

#[derive(Deserialize)]
struct EvaluationSaveRequest {
    id: String,
    #[serde(default)]
    status: Option<EvaluationStatus>,
    #[serde(default)]
    evaluator_name: Option<String>,
}

#[derive(Deserialize)]
struct EvaluationAttachRequest {
    evaluation_id: String,
    file_name: String,
    #[serde(default)]
    mime_type: String,
    #[serde(default)]
    size_bytes: f64,
}

#[derive(Deserialize)]
struct EvaluationDetachRequest {
    evaluation_id: String,
    document_id: String,
}

#[derive(Deserialize)]
struct ResponsesListRequest {
    evaluation_id: String,
}

#[derive(Deserialize)]
struct ResponseSetRequest {
    evaluation_id: String,
    indicator_id: String,
    score: f64,
    #[serde(default)]
    evidence_text: String,
}

#[derive(Deserialize)]
struct ComplianceGetRequest {
    institution_id: String,
    #[serde(default)]
    cycle_year: Option<i32>,
}

#[derive(Deserialize)]
struct ComplianceDraft {
    #[serde(default)]
    id: String,
    institution_id: String,
    #[serde(default)]
    cycle_year: Option<i32>,
    #[serde(default)]
    institution_status: InstitutionStatus,
    #[serde(default)]
    board_status: BoardStatus,
    #[serde(default)]
    board_end_date: String,
    #[serde(default)]
    has_executive_management: bool,
    #[serde(default)]
    has_auditor_company: bool,
    #[serde(default)]
    has_minutes_prev_year: bool,
    #[serde(default)]
    has_financial_report_prev_year: bool,
    #[serde(default)]
    custom_requirements: Vec<CustomRequirement>,
    #[serde(default)]
    followup_actions: String,
    #[serde(default)]
    notes: String,
}

fn default_risk_rating() -> i64 {
    1
}

#[derive(Deserialize)]
struct RiskDraft {
    #[serde(default)]
    id: String,
    #[serde(default)]
    institution_id: String,
    #[serde(default)]
    risk_title: String,
    #[serde(default)]
    category: RiskCategory,
    #[serde(default = "default_risk_rating")]
    probability: i64,
    #[serde(default = "default_risk_rating")]
    impact: i64,
    #[serde(default)]
    mitigation_plan: String,
    #[serde(default)]
    status: RiskStatus,
}

#[derive(Deserialize)]
struct RisksListRequest {
    #[serde(default)]
    institution_id: Option<String>,
}

#[derive(Serialize)]
struct RiskView {
    #[serde(flatten)]
    item: RiskRegisterItem,
    severity: i64,
    tier: &'static str,
}

#[derive(Deserialize)]
struct ImprovementsListRequest {
    evaluation_id: String,
}

fn default_improvement_priority() -> Priority {
    Priority::Medium
}

#[derive(Deserialize)]
struct ImprovementDraft {
    #[serde(default)]
    id: String,
    #[serde(default)]
    evaluation_id: String,
    #[serde(default)]
    indicator_id: String,
    #[serde(default = "default_improvement_priority")]
    priority: Priority,
    #[serde(default)]
    issue_summary: String,
    #[serde(default)]
    recommended_action: String,
    #[serde(default)]
    owner: String,
    #[serde(default)]
    due_date: String,
    #[serde(default)]
    status: ImprovementStatus,
    #[serde(default)]
    notes: String,
}

#[derive(Deserialize)]
struct GenerateRequest {
    evaluation_id: String,
}

#[derive(Deserialize)]
struct ReportRequest {
    institution_id: String,
}

#[derive(Deserialize)]
struct BackupImportRequest {
    data: String,
}

#[derive(Deserialize)]
struct EncryptedExportRequest {
    password: String,
}

#[derive(Deserialize)]
struct EncryptedImportRequest {
    password: String,
    data: String,
}

#[derive(Serialize)]
struct AxisScore {
    axis: String,
    average: f64,
    answered: usize,
}

#[derive(Serialize, Default)]
struct PriorityCounts {
    high: usize,
    medium: usize,
    low: usize,
}

#[derive(Serialize)]
struct ReportModel {
    evaluation: Evaluation,
    axis_scores: Vec<AxisScore>,
    improvements: Vec<ImprovementItem>,
    priorities: PriorityCounts,
}

#[derive(Serialize)]
struct NameCount {
    name: String,
    count: usize,
}

#[derive(Serialize)]
struct InstitutionScore {
    institution_id: String,
    name: String,
    average: f64,
}

#[derive(Serialize, Default)]
struct CapitalBands {
    small: usize,
    medium: usize,
    large: usize,
}

#[derive(Serialize)]
struct ComplianceSummary {
    institution_id: String,
    name: String,
    cycle_year: i32,
    score: i64,
    label: &'static str,
}

#[derive(Serialize)]
struct DashboardModel {
    institution_count: usize,
    total_capital_omr: f64,
    employees_omani: i64,
    employees_non_omani: i64,
    capital_bands: CapitalBands,
    governorate_counts: Vec<NameCount>,
    average_score: f64,
    top_institutions: Vec<InstitutionScore>,
    risk_matrix: RiskMatrixCounts,
    compliance: Vec<ComplianceSummary>,
}

fn login(store: &Store, payload: LoginRequest) -> Result<SessionInfo, String> {
    let username = clamp_string(payload.username.as_str(), 80, true);
    if username.is_empty() {
        return Err("Username is required.".to_string());
    }
    store.set_session_user(username.as_str())?;
    Ok(SessionInfo {
        user: Some(username),
        authenticated: true,
    })
}

fn logout(store: &Store) -> Result<bool, String> {
    store.clear_session()?;
    Ok(true)
}

fn session(store: &Store) -> Result<SessionInfo, String> {
    let user = store.session_user()?;
    Ok(SessionInfo {
        authenticated: user.is_some(),
        user,
    })
}

fn route_resolve(store: &Store, payload: RouteRequest) -> Result<String, String> {
    let authenticated = store.session_user()?.is_some();
    Ok(resolve_route(payload.path.as_str(), authenticated).to_string())
}

fn institutions_list(store: &Store) -> Result<Vec<Institution>, String> {
    store.list::<Institution>()
}

fn validate_location(governorate: &str, wilayat: &str) -> Result<(), String> {
    if governorate.is_empty() {
        if !wilayat.is_empty() {
            return Err("Select a governorate before a wilayat.".to_string());
        }
        return Ok(());
    }
    let Some(wilayats) = wilayats_for(governorate) else {
        return Err(format!("Unknown governorate: {governorate}"));
    };
    if !wilayat.is_empty() && !wilayats.contains(&wilayat) {
        return Err(format!(
            "Wilayat {wilayat} does not belong to governorate {governorate}."
        ));
    }
    Ok(())
}

fn institution_save(store: &Store, draft: InstitutionDraft) -> Result<Institution, String> {
    let name = clamp_string(draft.name.as_str(), 200, true);
    if name.is_empty() {
        return Err("Institution name is required.".to_string());
    }
    let governorate = clamp_string(draft.governorate.as_str(), 80, true);
    let wilayat = clamp_string(draft.wilayat.as_str(), 80, true);
    validate_location(governorate.as_str(), wilayat.as_str())?;

    let existing = if draft.id.is_empty() {
        None
    } else {
        store
            .list::<Institution>()?
            .into_iter()
            .find(|institution| institution.id == draft.id)
    };
    let created_at = if !draft.created_at.is_empty() {
        draft.created_at
    } else if let Some(existing) = &existing {
        existing.created_at.clone()
    } else {
        now_rfc3339()
    };
    let documents = match draft.documents {
        Some(documents) => documents,
        None => existing
            .as_ref()
            .map(|existing| existing.documents.clone())
            .unwrap_or_default(),
    };

    let institution = Institution {
        id: if draft.id.is_empty() {
            new_id()
        } else {
            draft.id
        },
        name,
        kind: draft.kind,
        capital_omr: draft.capital_omr.max(0.0),
        employees_omani: draft.employees_omani.max(0),
        employees_non_omani: draft.employees_non_omani.max(0),
        contact_phone: clamp_string(draft.contact_phone.as_str(), 40, true),
        email: clamp_string(draft.email.as_str(), 120, true),
        governorate,
        wilayat,
        establishment_date: clamp_string(draft.establishment_date.as_str(), 40, true),
        license_number: clamp_string(draft.license_number.as_str(), 80, true),
        manager_name: clamp_string(draft.manager_name.as_str(), 120, true),
        notes: clamp_string(draft.notes.as_str(), 2000, false),
        documents,
        created_at,
    };
    store.upsert(institution)
}

// Deleting an institution intentionally leaves its evaluations, responses,
// compliance records and risks behind; derived views filter the orphans.
fn institution_delete(store: &Store, payload: DeleteRequest) -> Result<bool, String> {
    store.delete::<Institution>(payload.id.as_str())
}

fn institution_attach_document(
    store: &Store,
    payload: InstitutionAttachRequest,
) -> Result<DocumentRef, String> {
    let file_name = clamp_string(payload.file_name.as_str(), 255, true);
    if file_name.is_empty() {
        return Err("File name is required.".to_string());
    }
    let mut institutions = store.list::<Institution>()?;
    let Some(institution) = institutions
        .iter_mut()
        .find(|institution| institution.id == payload.institution_id)
    else {
        return Err("Institution not found.".to_string());
    };
    let document = document_ref(
        file_name.as_str(),
        payload.mime_type.as_str(),
        payload.size_bytes,
    );
    institution.documents.push(document.clone());
    store.write_all(institutions.as_slice())?;
    Ok(document)
}

fn institution_remove_document(
    store: &Store,
    payload: InstitutionDetachRequest,
) -> Result<bool, String> {
    let mut institutions = store.list::<Institution>()?;
    let Some(institution) = institutions
        .iter_mut()
        .find(|institution| institution.id == payload.institution_id)
    else {
        return Err("Institution not found.".to_string());
    };
    let before = institution.documents.len();
    institution
        .documents
        .retain(|document| document.id != payload.document_id);
    if institution.documents.len() == before {
        return Ok(false);
    }
    store.write_all(institutions.as_slice())?;
    Ok(true)
}

/// Returns the stored catalog, seeding the default one on first read.
fn load_indicators(store: &Store) -> Result<Vec<Indicator>, String> {
    let stored = store.list::<Indicator>()?;
    if !stored.is_empty() {
        return Ok(stored);
    }
    let defaults = default_indicators();
    store.write_all(defaults.as_slice())?;
    Ok(defaults)
}

fn indicators_list(store: &Store) -> Result<Vec<Indicator>, String> {
    load_indicators(store)
}

fn indicator_add(store: &Store, payload: IndicatorAddRequest) -> Result<Indicator, String> {
    let axis = clamp_string(payload.axis.as_str(), 120, true);
    let text = clamp_string(payload.text.as_str(), 500, true);
    if axis.is_empty() || text.is_empty() {
        return Err("Axis and indicator text are required.".to_string());
    }
    let mut indicators = load_indicators(store)?;
    let indicator = Indicator {
        id: format!("IND-MANUAL-{}", short_hex(3)),
        axis,
        text,
        weight: 1.0,
        active: true,
    };
    indicators.push(indicator.clone());
    store.write_all(indicators.as_slice())?;
    Ok(indicator)
}

fn indicator_remove(store: &Store, payload: DeleteRequest) -> Result<bool, String> {
    let mut indicators = load_indicators(store)?;
    let before = indicators.len();
    indicators.retain(|indicator| indicator.id != payload.id);
    if indicators.len() == before {
        return Ok(false);
    }
    store.write_all(indicators.as_slice())?;
    Ok(true)
}

fn indicators_replace(store: &Store, payload: IndicatorsReplaceRequest) -> Result<usize, String> {
    store.write_all(payload.indicators.as_slice())?;
    Ok(payload.indicators.len())
}

/// Replaces the whole catalog with rows parsed from the first worksheet of
/// an uploaded workbook. Destructive; the caller confirms beforehand.
fn indicators_import_rows(store: &Store, payload: SheetImportRequest) -> Result<usize, String> {
    let mapped = map_sheet_rows(payload.rows.as_slice());
    if mapped.is_empty() {
        return Err("No usable indicator rows were found in the sheet.".to_string());
    }
    store.write_all(mapped.as_slice())?;
    Ok(mapped.len())
}

/// Finds the evaluation for (institution, cycle year), creating a draft on
/// first visit so scoring can start immediately.
fn evaluation_open(store: &Store, payload: EvaluationOpenRequest) -> Result<Evaluation, String> {
    let institution_id = clamp_string(payload.institution_id.as_str(), 128, true);
    if institution_id.is_empty() {
        return Err("Institution is required.".to_string());
    }
    let known = store
        .list::<Institution>()?
        .iter()
        .any(|institution| institution.id == institution_id);
    if !known {
        return Err("Institution not found.".to_string());
    }
    let cycle_year = payload.cycle_year.unwrap_or_else(current_cycle_year);
    if let Some(found) = store
        .list::<Evaluation>()?
        .into_iter()
        .find(|evaluation| {
            evaluation.institution_id == institution_id && evaluation.cycle_year == cycle_year
        })
    {
        return Ok(found);
    }
    let evaluation = Evaluation {
        id: new_id(),
        institution_id,
        cycle_year,
        cycle_date: now_rfc3339(),
        evaluator_name: String::new(),
        status: EvaluationStatus::Draft,
        attachments: Vec::new(),
        created_at: now_rfc3339(),
    };
    store.upsert(evaluation)
}

fn evaluation_save(store: &Store, payload: EvaluationSaveRequest) -> Result<Evaluation, String> {
    let mut evaluations = store.list::<Evaluation>()?;
    let Some(evaluation) = evaluations
        .iter_mut()
        .find(|evaluation| evaluation.id == payload.id)
    else {
        return Err("Evaluation not found.".to_string());
    };
    if let Some(status) = payload.status {
        evaluation.status = status;
    }
    if let Some(evaluator_name) = payload.evaluator_name {
        evaluation.evaluator_name = clamp_string(evaluator_name.as_str(), 120, true);
    }
    let out = evaluation.clone();
    store.write_all(evaluations.as_slice())?;
    Ok(out)
}

fn evaluation_attach_document(
    store: &Store,
    payload: EvaluationAttachRequest,
) -> Result<DocumentRef, String> {
    let file_name = clamp_string(payload.file_name.as_str(), 255, true);
    if file_name.is_empty() {
        return Err("File name is required.".to_string());
    }
    let mut evaluations = store.list::<Evaluation>()?;
    let Some(evaluation) = evaluations
        .iter_mut()
        .find(|evaluation| evaluation.id == payload.evaluation_id)
    else {
        return Err("Evaluation not found.".to_string());
    };
    let document = document_ref(
        file_name.as_str(),
        payload.mime_type.as_str(),
        payload.size_bytes,
    );
    evaluation.attachments.push(document.clone());
    store.write_all(evaluations.as_slice())?;
    Ok(document)
}

fn evaluation_remove_document(
    store: &Store,
    payload: EvaluationDetachRequest,
) -> Result<bool, String> {
    let mut evaluations = store.list::<Evaluation>()?;
    let Some(evaluation) = evaluations
        .iter_mut()
        .find(|evaluation| evaluation.id == payload.evaluation_id)
    else {
        return Err("Evaluation not found.".to_string());
    };
    let before = evaluation.attachments.len();
    evaluation
        .attachments
        .retain(|document| document.id != payload.document_id);
    if evaluation.attachments.len() == before {
        return Ok(false);
    }
    store.write_all(evaluations.as_slice())?;
    Ok(true)
}

fn responses_list(
    store: &Store,
    payload: ResponsesListRequest,
) -> Result<BTreeMap<String, Response>, String> {
    let mut out = BTreeMap::new();
    for response in store.list::<Response>()? {
        if response.evaluation_id == payload.evaluation_id {
            out.insert(response.indicator_id.clone(), response);
        }
    }
    Ok(out)
}

/// Upserts the response for (evaluation, indicator); a rescore replaces the
/// previous score in place.
fn response_set(store: &Store, payload: ResponseSetRequest) -> Result<Response, String> {
    let evaluation_id = clamp_string(payload.evaluation_id.as_str(), 128, true);
    let indicator_id = clamp_string(payload.indicator_id.as_str(), 128, true);
    if evaluation_id.is_empty() || indicator_id.is_empty() {
        return Err("Evaluation and indicator are required.".to_string());
    }
    if !(1.0..=5.0).contains(&payload.score) {
        return Err("Score must be between 1 and 5.".to_string());
    }
    let evidence_text = clamp_string(payload.evidence_text.as_str(), 2000, false);
    let mut responses = store.list::<Response>()?;
    let position = responses.iter().position(|response| {
        response.evaluation_id == evaluation_id && response.indicator_id == indicator_id
    });
    let out = match position {
        Some(index) => {
            responses[index].score = payload.score;
            responses[index].evidence_text = evidence_text;
            responses[index].updated_at = now_rfc3339();
            responses[index].clone()
        }
        None => {
            let response = Response {
                id: new_id(),
                evaluation_id,
                indicator_id,
                score: payload.score,
                evidence_text,
                updated_at: now_rfc3339(),
            };
            responses.push(response.clone());
            response
        }
    };
    store.write_all(responses.as_slice())?;
    Ok(out)
}

fn default_compliance_record(institution_id: &str, cycle_year: i32) -> ComplianceRecord {
    ComplianceRecord {
        id: String::new(),
        institution_id: institution_id.to_string(),
        cycle_year,
        institution_status: InstitutionStatus::Active,
        board_status: BoardStatus::Current,
        board_end_date: String::new(),
        has_executive_management: false,
        has_auditor_company: false,
        has_minutes_prev_year: false,
        has_financial_report_prev_year: false,
        custom_requirements: Vec::new(),
        followup_actions: String::new(),
        notes: String::new(),
        last_updated_at: String::new(),
    }
}

fn find_compliance_record(
    store: &Store,
    institution_id: &str,
    cycle_year: i32,
) -> Result<Option<ComplianceRecord>, String> {
    Ok(store.list::<ComplianceRecord>()?.into_iter().find(|record| {
        record.institution_id == institution_id && record.cycle_year == cycle_year
    }))
}

fn compliance_get(
    store: &Store,
    payload: ComplianceGetRequest,
) -> Result<ComplianceRecord, String> {
    let cycle_year = payload.cycle_year.unwrap_or_else(current_cycle_year);
    let found = find_compliance_record(store, payload.institution_id.as_str(), cycle_year)?;
    Ok(found.unwrap_or_else(|| {
        default_compliance_record(payload.institution_id.as_str(), cycle_year)
    }))
}

fn compliance_save(store: &Store, draft: ComplianceDraft) -> Result<serde_json::Value, String> {
    let institution_id = clamp_string(draft.institution_id.as_str(), 128, true);
    if institution_id.is_empty() {
        return Err("Institution is required.".to_string());
    }
    let cycle_year = draft.cycle_year.unwrap_or_else(current_cycle_year);
    let id = if !draft.id.is_empty() {
        draft.id
    } else {
        find_compliance_record(store, institution_id.as_str(), cycle_year)?
            .map(|record| record.id)
            .unwrap_or_else(new_id)
    };
    let custom_requirements = draft
        .custom_requirements
        .into_iter()
        .map(|requirement| CustomRequirement {
            id: if requirement.id.is_empty() {
                new_id()
            } else {
                requirement.id
            },
            text: clamp_string(requirement.text.as_str(), 500, true),
            met: requirement.met,
        })
        .filter(|requirement| !requirement.text.is_empty())
        .collect();
    let record = ComplianceRecord {
        id,
        institution_id,
        cycle_year,
        institution_status: draft.institution_status,
        board_status: draft.board_status,
        board_end_date: clamp_string(draft.board_end_date.as_str(), 40, true),
        has_executive_management: draft.has_executive_management,
        has_auditor_company: draft.has_auditor_company,
        has_minutes_prev_year: draft.has_minutes_prev_year,
        has_financial_report_prev_year: draft.has_financial_report_prev_year,
        custom_requirements,
        followup_actions: clamp_string(draft.followup_actions.as_str(), 2000, false),
        notes: clamp_string(draft.notes.as_str(), 2000, false),
        last_updated_at: now_rfc3339(),
    };
    let saved = store.upsert(record)?;
    let (score, label) = compliance_risk_score(&saved);
    Ok(json!({
        "record": saved,
        "risk": { "score": score, "label": label },
    }))
}

fn compliance_risk(
    store: &Store,
    payload: ComplianceGetRequest,
) -> Result<serde_json::Value, String> {
    let record = compliance_get(store, payload)?;
    let (score, label) = compliance_risk_score(&record);
    Ok(json!({ "score": score, "label": label }))
}

fn risk_view(item: RiskRegisterItem) -> RiskView {
    let severity = risk_severity(item.probability, item.impact);
    RiskView {
        severity,
        tier: risk_tier(severity),
        item,
    }
}

fn risks_list(store: &Store, payload: RisksListRequest) -> Result<Vec<RiskView>, String> {
    let risks = store.list::<RiskRegisterItem>()?;
    Ok(risks
        .into_iter()
        .filter(|risk| match &payload.institution_id {
            Some(institution_id) => risk.institution_id == *institution_id,
            None => true,
        })
        .map(risk_view)
        .collect())
}

fn risk_save(store: &Store, draft: RiskDraft) -> Result<RiskView, String> {
    let institution_id = clamp_string(draft.institution_id.as_str(), 128, true);
    let risk_title = clamp_string(draft.risk_title.as_str(), 300, true);
    if institution_id.is_empty() || risk_title.is_empty() {
        return Err("Institution and risk title are required.".to_string());
    }
    let item = RiskRegisterItem {
        id: if draft.id.is_empty() { new_id() } else { draft.id },
        institution_id,
        risk_title,
        category: draft.category,
        probability: draft.probability.clamp(1, 5),
        impact: draft.impact.clamp(1, 5),
        mitigation_plan: clamp_string(draft.mitigation_plan.as_str(), 2000, false),
        status: draft.status,
    };
    let saved = store.upsert(item)?;
    Ok(risk_view(saved))
}

fn risk_delete(store: &Store, payload: DeleteRequest) -> Result<bool, String> {
    store.delete::<RiskRegisterItem>(payload.id.as_str())
}

fn improvements_list(
    store: &Store,
    payload: ImprovementsListRequest,
) -> Result<Vec<ImprovementItem>, String> {
    Ok(store
        .list::<ImprovementItem>()?
        .into_iter()
        .filter(|item| item.evaluation_id == payload.evaluation_id)
        .collect())
}

fn improvement_save(store: &Store, draft: ImprovementDraft) -> Result<ImprovementItem, String> {
    let evaluation_id = clamp_string(draft.evaluation_id.as_str(), 128, true);
    let indicator_id = clamp_string(draft.indicator_id.as_str(), 128, true);
    if evaluation_id.is_empty() || indicator_id.is_empty() {
        return Err("Evaluation and indicator are required.".to_string());
    }
    let item = ImprovementItem {
        id: if draft.id.is_empty() { new_id() } else { draft.id },
        evaluation_id,
        indicator_id,
        priority: draft.priority,
        issue_summary: clamp_string(draft.issue_summary.as_str(), 600, true),
        recommended_action: clamp_string(draft.recommended_action.as_str(), 600, true),
        owner: clamp_string(draft.owner.as_str(), 120, true),
        due_date: clamp_string(draft.due_date.as_str(), 40, true),
        status: draft.status,
        notes: clamp_string(draft.notes.as_str(), 2000, false),
    };
    store.upsert(item)
}

fn improvements_generate(
    store: &Store,
    payload: GenerateRequest,
) -> Result<serde_json::Value, String> {
    let evaluation_id = clamp_string(payload.evaluation_id.as_str(), 128, true);
    if evaluation_id.is_empty() {
        return Err("Evaluation is required.".to_string());
    }
    let responses = store.list::<Response>()?;
    let indicators = load_indicators(store)?;
    let mut all = store.list::<ImprovementItem>()?;
    let existing: Vec<ImprovementItem> = all
        .iter()
        .filter(|item| item.evaluation_id == evaluation_id)
        .cloned()
        .collect();
    let added = derive_improvement_items(
        evaluation_id.as_str(),
        responses.as_slice(),
        indicators.as_slice(),
        existing.as_slice(),
        today(),
    );
    if !added.is_empty() {
        all.extend(added.iter().cloned());
        store.write_all(all.as_slice())?;
    }
    let items: Vec<ImprovementItem> = all
        .into_iter()
        .filter(|item| item.evaluation_id == evaluation_id)
        .collect();
    Ok(json!({ "added": added.len(), "items": items }))
}

fn axis_scores(indicators: &[Indicator], responses: &[Response]) -> Vec<AxisScore> {
    let mut axes: Vec<String> = Vec::new();
    for indicator in indicators {
        if !axes.contains(&indicator.axis) {
            axes.push(indicator.axis.clone());
        }
    }
    let mut totals: Vec<(f64, usize)> = vec![(0.0, 0); axes.len()];
    for response in responses {
        // Responses pointing at indicators removed from the catalog are
        // filtered here instead of failing the report.
        let Some(indicator) = indicators
            .iter()
            .find(|indicator| indicator.id == response.indicator_id)
        else {
            continue;
        };
        if let Some(position) = axes.iter().position(|axis| *axis == indicator.axis) {
            totals[position].0 += response.score;
            totals[position].1 += 1;
        }
    }
    axes.into_iter()
        .zip(totals)
        .map(|(axis, (total, answered))| AxisScore {
            axis,
            average: if answered > 0 {
                round2(total / answered as f64)
            } else {
                0.0
            },
            answered,
        })
        .collect()
}

/// Builds the per-institution report model. Plan generation runs first, the
/// same way the report view drives it.
fn report_model(store: &Store, payload: ReportRequest) -> Result<ReportModel, String> {
    let institution_id = clamp_string(payload.institution_id.as_str(), 128, true);
    if institution_id.is_empty() {
        return Err("Institution is required.".to_string());
    }
    let Some(evaluation) = store
        .list::<Evaluation>()?
        .into_iter()
        .find(|evaluation| evaluation.institution_id == institution_id)
    else {
        return Err("No evaluation recorded for this institution yet.".to_string());
    };
    let indicators = load_indicators(store)?;
    let responses: Vec<Response> = store
        .list::<Response>()?
        .into_iter()
        .filter(|response| response.evaluation_id == evaluation.id)
        .collect();

    let mut all_improvements = store.list::<ImprovementItem>()?;
    let existing: Vec<ImprovementItem> = all_improvements
        .iter()
        .filter(|item| item.evaluation_id == evaluation.id)
        .cloned()
        .collect();
    let added = derive_improvement_items(
        evaluation.id.as_str(),
        responses.as_slice(),
        indicators.as_slice(),
        existing.as_slice(),
        today(),
    );
    if !added.is_empty() {
        all_improvements.extend(added);
        store.write_all(all_improvements.as_slice())?;
    }
    let improvements: Vec<ImprovementItem> = all_improvements
        .into_iter()
        .filter(|item| item.evaluation_id == evaluation.id)
        .collect();

    let mut priorities = PriorityCounts::default();
    for item in &improvements {
        match item.priority {
            Priority::High => priorities.high += 1,
            Priority::Medium => priorities.medium += 1,
            Priority::Low => priorities.low += 1,
        }
    }

    Ok(ReportModel {
        axis_scores: axis_scores(indicators.as_slice(), responses.as_slice()),
        evaluation,
        improvements,
        priorities,
    })
}

fn dashboard_model(store: &Store) -> Result<DashboardModel, String> {
    let institutions = store.list::<Institution>()?;
    let evaluations = store.list::<Evaluation>()?;
    let responses = store.list::<Response>()?;
    let risks = store.list::<RiskRegisterItem>()?;
    let compliance_records = store.list::<ComplianceRecord>()?;

    let mut total_capital_omr = 0.0;
    let mut employees_omani = 0;
    let mut employees_non_omani = 0;
    let mut capital_bands = CapitalBands::default();
    for institution in &institutions {
        total_capital_omr += institution.capital_omr;
        employees_omani += institution.employees_omani;
        employees_non_omani += institution.employees_non_omani;
        if institution.capital_omr < CAPITAL_SMALL_LIMIT_OMR {
            capital_bands.small += 1;
        } else if institution.capital_omr < CAPITAL_MEDIUM_LIMIT_OMR {
            capital_bands.medium += 1;
        } else {
            capital_bands.large += 1;
        }
    }

    let governorate_counts: Vec<NameCount> = OMAN_WILAYATS
        .iter()
        .map(|(governorate, _)| NameCount {
            name: (*governorate).to_string(),
            count: institutions
                .iter()
                .filter(|institution| institution.governorate == *governorate)
                .count(),
        })
        .filter(|entry| entry.count > 0)
        .collect();

    let average_score = if responses.is_empty() {
        0.0
    } else {
        round2(responses.iter().map(|r| r.score).sum::<f64>() / responses.len() as f64)
    };

    // Per-institution averages across all of its evaluations; evaluations
    // whose institution was deleted are skipped.
    let mut institution_totals: Vec<(String, f64, usize)> = Vec::new();
    for evaluation in &evaluations {
        let Some(institution) = institutions
            .iter()
            .find(|institution| institution.id == evaluation.institution_id)
        else {
            continue;
        };
        let (total, count) = responses
            .iter()
            .filter(|response| response.evaluation_id == evaluation.id)
            .fold((0.0, 0usize), |(total, count), response| {
                (total + response.score, count + 1)
            });
        if count == 0 {
            continue;
        }
        match institution_totals
            .iter()
            .position(|(id, _, _)| *id == institution.id)
        {
            Some(index) => {
                institution_totals[index].1 += total;
                institution_totals[index].2 += count;
            }
            None => institution_totals.push((institution.id.clone(), total, count)),
        }
    }
    let mut top_institutions: Vec<InstitutionScore> = institution_totals
        .into_iter()
        .map(|(institution_id, total, count)| InstitutionScore {
            name: institutions
                .iter()
                .find(|institution| institution.id == institution_id)
                .map(|institution| institution.name.clone())
                .unwrap_or_default(),
            institution_id,
            average: round2(total / count as f64),
        })
        .collect();
    top_institutions.sort_by(|a, b| {
        b.average
            .partial_cmp(&a.average)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    top_institutions.truncate(5);

    let compliance: Vec<ComplianceSummary> = compliance_records
        .iter()
        .filter_map(|record| {
            let institution = institutions
                .iter()
                .find(|institution| institution.id == record.institution_id)?;
            let (score, label) = compliance_risk_score(record);
            Some(ComplianceSummary {
                institution_id: institution.id.clone(),
                name: institution.name.clone(),
                cycle_year: record.cycle_year,
                score,
                label,
            })
        })
        .collect();

    Ok(DashboardModel {
        institution_count: institutions.len(),
        total_capital_omr,
        employees_omani,
        employees_non_omani,
        capital_bands,
        governorate_counts,
        average_score,
        top_institutions,
        risk_matrix: risk_matrix_counts(risks.as_slice()),
        compliance,
    })
}

fn settings_get(store: &Store) -> Result<Settings, String> {
    store.settings()
}

fn settings_save(store: &Store, payload: Settings) -> Result<Settings, String> {
    let settings = Settings {
        org_name: clamp_string(payload.org_name.as_str(), 200, true),
        supervisor_name: clamp_string(payload.supervisor_name.as_str(), 120, true),
        dark_mode: payload.dark_mode,
    };
    store.save_settings(&settings)?;
    Ok(settings)
}

fn backup_export(store: &Store) -> Result<serde_json::Value, String> {
    Ok(serde_json::Value::Object(store.export_backup()?))
}

fn backup_import(store: &Store, payload: BackupImportRequest) -> Result<usize, String> {
    store.import_backup(payload.data.as_str())
}

fn backup_export_encrypted(
    store: &Store,
    payload: EncryptedExportRequest,
) -> Result<String, String> {
    let password = clamp_string(payload.password.as_str(), 256, false);
    if password.is_empty() {
        return Err("Password is required.".to_string());
    }
    let document = serde_json::Value::Object(store.export_backup()?);
    let plaintext = serde_json::to_string(&document).map_err(|err| err.to_string())?;
    let envelope = encrypt_text(plaintext.as_str(), password.as_str())?;
    serde_json::to_string(&envelope).map_err(|err| err.to_string())
}

fn backup_import_encrypted(
    store: &Store,
    payload: EncryptedImportRequest,
) -> Result<usize, String> {
    let password = clamp_string(payload.password.as_str(), 256, false);
    if password.is_empty() {
        return Err("Password is required.".to_string());
    }
    let envelope: CryptoEnvelope = serde_json::from_str(payload.data.as_str())
        .map_err(|_| "Backup file is not a valid encrypted envelope.".to_string())?;
    let Some(plaintext) = decrypt_envelope(&envelope, password.as_str())? else {
        return Err("Unable to decrypt the backup file. Check the password.".to_string());
    };
    store.import_backup(plaintext.as_str())
}

fn clear_all_data(store: &Store) -> Result<bool, String> {
    store.clear_all()?;
    Ok(true)
}

fn parse_payload<T: DeserializeOwned>(payload: serde_json::Value) -> Result<T, String> {
    serde_json::from_value(payload).map_err(|err| err.to_string())
}

fn to_json<T: Serialize>(value: T) -> Result<serde_json::Value, String> {
    serde_json::to_value(value).map_err(|err| err.to_string())
}

fn dispatch(
    store: &Store,
    cmd: &str,
    payload: serde_json::Value,
) -> Result<serde_json::Value, String> {
    match cmd {
        "login" => to_json(login(store, parse_payload(payload)?)?),
        "logout" => to_json(logout(store)?),
        "session" => to_json(session(store)?),
        "route_resolve" => to_json(route_resolve(store, parse_payload(payload)?)?),
        "institutions_list" => to_json(institutions_list(store)?),
        "institution_save" => to_json(institution_save(store, parse_payload(payload)?)?),
        "institution_delete" => to_json(institution_delete(store, parse_payload(payload)?)?),
        "institution_attach_document" => {
            to_json(institution_attach_document(store, parse_payload(payload)?)?)
        }
        "institution_remove_document" => {
            to_json(institution_remove_document(store, parse_payload(payload)?)?)
        }
        "indicators_list" => to_json(indicators_list(store)?),
        "indicator_add" => to_json(indicator_add(store, parse_payload(payload)?)?),
        "indicator_remove" => to_json(indicator_remove(store, parse_payload(payload)?)?),
        "indicators_replace" => to_json(indicators_replace(store, parse_payload(payload)?)?),
        "indicators_import_rows" => {
            to_json(indicators_import_rows(store, parse_payload(payload)?)?)
        }
        "evaluation_open" => to_json(evaluation_open(store, parse_payload(payload)?)?),
        "evaluation_save" => to_json(evaluation_save(store, parse_payload(payload)?)?),
        "evaluation_attach_document" => {
            to_json(evaluation_attach_document(store, parse_payload(payload)?)?)
        }
        "evaluation_remove_document" => {
            to_json(evaluation_remove_document(store, parse_payload(payload)?)?)
        }
        "responses_list" => to_json(responses_list(store, parse_payload(payload)?)?),
        "response_set" => to_json(response_set(store, parse_payload(payload)?)?),
        "compliance_get" => to_json(compliance_get(store, parse_payload(payload)?)?),
        "compliance_save" => to_json(compliance_save(store, parse_payload(payload)?)?),
        "compliance_risk" => to_json(compliance_risk(store, parse_payload(payload)?)?),
        "risks_list" => to_json(risks_list(store, parse_payload(payload)?)?),
        "risk_save" => to_json(risk_save(store, parse_payload(payload)?)?),
        "risk_delete" => to_json(risk_delete(store, parse_payload(payload)?)?),
        "improvements_list" => to_json(improvements_list(store, parse_payload(payload)?)?),
        "improvement_save" => to_json(improvement_save(store, parse_payload(payload)?)?),
        "improvements_generate" => to_json(improvements_generate(store, parse_payload(payload)?)?),
        "report_model" => to_json(report_model(store, parse_payload(payload)?)?),
        "dashboard_model" => to_json(dashboard_model(store)?),
        "settings_get" => to_json(settings_get(store)?),
        "settings_save" => to_json(settings_save(store, parse_payload(payload)?)?),
        "backup_export" => backup_export(store),
        "backup_import" => to_json(backup_import(store, parse_payload(payload)?)?),
        "backup_export_encrypted" => {
            to_json(backup_export_encrypted(store, parse_payload(payload)?)?)
        }
        "backup_import_encrypted" => {
            to_json(backup_import_encrypted(store, parse_payload(payload)?)?)
        }
        "clear_all" => to_json(clear_all_data(store)?),
        _ => Err(format!("Unknown command: {cmd}")),
    }
}

fn storage_root_dir() -> PathBuf {
    if let Some(dir) = env::var_os("WAQF_DASHBOARD_DIR") {
        return PathBuf::from(dir);
    }
    if let Some(home) = env::var_os("HOME") {
        return PathBuf::from(home)
            .join(".local")
            .join("share")
            .join("waqf-dashboard");
    }
    PathBuf::from("waqf-dashboard-data")
}

#[derive(Deserialize)]
struct CommandRequest {
    cmd: String,
    #[serde(default)]
    payload: serde_json::Value,
}

fn main() {
    let store = match Store::open(storage_root_dir()) {
        Ok(store) => store,
        Err(err) => {
            eprintln!("waqf-dashboard: {err}");
            std::process::exit(1);
        }
    };

    let stdin = io::stdin();
    let mut stdout = io::stdout();
    for line in stdin.lock().lines() {
        let Ok(line) = line else {
            break;
        };
        if line.trim().is_empty() {
            continue;
        }
        let response = match serde_json::from_str::<CommandRequest>(line.as_str()) {
            Ok(request) => match dispatch(&store, request.cmd.as_str(), request.payload) {
                Ok(result) => json!({ "ok": true, "result": result }),
                Err(error) => json!({ "ok": false, "error": error }),
            },
            Err(err) => json!({ "ok": false, "error": format!("Invalid command: {err}") }),
        };
        let Ok(encoded) = serde_json::to_string(&response) else {
            continue;
        };
        if writeln!(stdout, "{encoded}").is_err() {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tempfile::TempDir;

    fn test_store() -> (TempDir, Store) {
        let dir = TempDir::new().unwrap();
        let store = Store::open(dir.path().to_path_buf()).unwrap();
        (dir, store)
    }

    fn from_json<T: DeserializeOwned>(value: serde_json::Value) -> T {
        serde_json::from_value(value).unwrap()
    }

    fn add_institution(store: &Store, name: &str) -> Institution {
        institution_save(store, from_json(json!({ "name": name }))).unwrap()
    }

    fn compliant_record() -> ComplianceRecord {
        ComplianceRecord {
            id: "c1".to_string(),
            institution_id: "i1".to_string(),
            cycle_year: 2026,
            institution_status: InstitutionStatus::Active,
            board_status: BoardStatus::Current,
            board_end_date: String::new(),
            has_executive_management: true,
            has_auditor_company: true,
            has_minutes_prev_year: true,
            has_financial_report_prev_year: true,
            custom_requirements: Vec::new(),
            followup_actions: String::new(),
            notes: String::new(),
            last_updated_at: String::new(),
        }
    }

    fn response_for(evaluation_id: &str, indicator_id: &str, score: f64) -> Response {
        Response {
            id: format!("r-{indicator_id}"),
            evaluation_id: evaluation_id.to_string(),
            indicator_id: indicator_id.to_string(),
            score,
            evidence_text: String::new(),
            updated_at: String::new(),
        }
    }

    #[test]
    fn fully_compliant_record_scores_zero() {
        let (score, label) = compliance_risk_score(&compliant_record());
        assert_eq!(score, 0);
        assert_eq!(label, "Low");
    }

    #[test]
    fn worst_case_record_scores_thirteen() {
        let mut record = compliant_record();
        record.institution_status = InstitutionStatus::Suspended;
        record.board_status = BoardStatus::Absent;
        record.has_executive_management = false;
        record.has_auditor_company = false;
        record.has_minutes_prev_year = false;
        record.has_financial_report_prev_year = false;
        let (score, label) = compliance_risk_score(&record);
        assert_eq!(score, 13);
        assert_eq!(label, "Critical");
    }

    #[test]
    fn each_compliance_gap_adds_its_weight() {
        let mut record = compliant_record();
        record.has_minutes_prev_year = false;
        assert_eq!(compliance_risk_score(&record).0, 1);
        record.has_auditor_company = false;
        assert_eq!(compliance_risk_score(&record).0, 3);
        record.board_status = BoardStatus::Expired;
        assert_eq!(compliance_risk_score(&record).0, 6);
        record.institution_status = InstitutionStatus::InLiquidation;
        assert_eq!(compliance_risk_score(&record).0, 9);
    }

    #[test]
    fn compliance_label_thresholds() {
        assert_eq!(compliance_risk_label(0), "Low");
        assert_eq!(compliance_risk_label(2), "Low");
        assert_eq!(compliance_risk_label(3), "Medium");
        assert_eq!(compliance_risk_label(6), "High");
        assert_eq!(compliance_risk_label(9), "Critical");
        assert_eq!(compliance_risk_label(13), "Critical");
    }

    #[test]
    fn risk_tier_thresholds() {
        assert_eq!(risk_tier(risk_severity(5, 5)), "High");
        assert_eq!(risk_tier(risk_severity(5, 3)), "High");
        assert_eq!(risk_tier(risk_severity(4, 2)), "Medium");
        assert_eq!(risk_tier(risk_severity(2, 3)), "Low");
        assert_eq!(risk_tier(risk_severity(1, 1)), "Low");
        assert_eq!(risk_tier(7), "Low");
        assert_eq!(risk_tier(8), "Medium");
        assert_eq!(risk_tier(15), "High");
    }

    #[test]
    fn risk_matrix_counts_partition_the_register() {
        let make = |probability, impact| RiskRegisterItem {
            id: new_id(),
            institution_id: "i1".to_string(),
            risk_title: "t".to_string(),
            category: RiskCategory::Operational,
            probability,
            impact,
            mitigation_plan: String::new(),
            status: RiskStatus::Open,
        };
        let risks = vec![make(5, 5), make(4, 2), make(2, 3), make(1, 1)];
        let counts = risk_matrix_counts(risks.as_slice());
        assert_eq!(counts.high, 1);
        assert_eq!(counts.medium, 1);
        assert_eq!(counts.low, 2);
        assert_eq!(counts.high + counts.medium + counts.low, counts.total);
    }

    #[test]
    fn generator_priorities_follow_score_thresholds() {
        let indicators = vec![
            seed_indicator("a", AXIS_GOVERNANCE, "Board charter in place"),
            seed_indicator("b", AXIS_GOVERNANCE, "Minutes archived"),
            seed_indicator("c", AXIS_GOVERNANCE, "Audit committee active"),
            seed_indicator("d", AXIS_GOVERNANCE, "Disclosure policy published"),
        ];
        let responses = vec![
            response_for("e1", "a", 2.4),
            response_for("e1", "b", 2.5),
            response_for("e1", "c", 3.4),
            response_for("e1", "d", 3.5),
        ];
        let items = derive_improvement_items(
            "e1",
            responses.as_slice(),
            indicators.as_slice(),
            &[],
            NaiveDate::from_ymd_opt(2026, 1, 15).unwrap(),
        );
        assert_eq!(items.len(), 3);
        let priority_of = |indicator_id: &str| {
            items
                .iter()
                .find(|item| item.indicator_id == indicator_id)
                .unwrap()
                .priority
        };
        assert_eq!(priority_of("a"), Priority::High);
        assert_eq!(priority_of("b"), Priority::Medium);
        assert_eq!(priority_of("c"), Priority::Medium);
        assert!(items.iter().all(|item| item.indicator_id != "d"));
        assert!(items
            .iter()
            .all(|item| item.status == ImprovementStatus::Todo));
        assert!(items.iter().all(|item| item.owner == IMPROVEMENT_OWNER));
    }

    #[test]
    fn generator_is_idempotent() {
        let indicators = vec![seed_indicator("a", AXIS_GOVERNANCE, "Board charter")];
        let responses = vec![response_for("e1", "a", 2.0)];
        let today = NaiveDate::from_ymd_opt(2026, 1, 15).unwrap();
        let first =
            derive_improvement_items("e1", responses.as_slice(), indicators.as_slice(), &[], today);
        assert_eq!(first.len(), 1);
        let second = derive_improvement_items(
            "e1",
            responses.as_slice(),
            indicators.as_slice(),
            first.as_slice(),
            today,
        );
        assert!(second.is_empty());
    }

    #[test]
    fn generator_skips_responses_without_a_catalog_indicator() {
        let indicators = vec![seed_indicator("a", AXIS_GOVERNANCE, "Board charter")];
        let responses = vec![
            response_for("e1", "a", 2.0),
            response_for("e1", "ghost", 1.0),
        ];
        let items = derive_improvement_items(
            "e1",
            responses.as_slice(),
            indicators.as_slice(),
            &[],
            NaiveDate::from_ymd_opt(2026, 1, 15).unwrap(),
        );
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].indicator_id, "a");
    }

    #[test]
    fn generator_ignores_other_evaluations() {
        let indicators = vec![seed_indicator("a", AXIS_GOVERNANCE, "Board charter")];
        let responses = vec![response_for("other", "a", 1.0)];
        let items = derive_improvement_items(
            "e1",
            responses.as_slice(),
            indicators.as_slice(),
            &[],
            NaiveDate::from_ymd_opt(2026, 1, 15).unwrap(),
        );
        assert!(items.is_empty());
    }

    #[test]
    fn generator_due_date_is_three_calendar_months_out() {
        let indicators = vec![seed_indicator("a", AXIS_GOVERNANCE, "Board charter")];
        let responses = vec![response_for("e1", "a", 2.0)];
        let items = derive_improvement_items(
            "e1",
            responses.as_slice(),
            indicators.as_slice(),
            &[],
            NaiveDate::from_ymd_opt(2026, 1, 15).unwrap(),
        );
        assert_eq!(items[0].due_date, "2026-04-15");

        let clamped = derive_improvement_items(
            "e1",
            responses.as_slice(),
            indicators.as_slice(),
            &[],
            NaiveDate::from_ymd_opt(2025, 11, 30).unwrap(),
        );
        assert_eq!(clamped[0].due_date, "2026-02-28");
    }

    #[test]
    fn sheet_rows_accept_both_text_headers_and_default_axis() {
        let rows = vec![
            json!({ "Axis": "Governance", "Question": "Has a board?" }),
            json!({ "Indicator": "Keeps minutes?" }),
            json!({ "Axis": "Finance", "Question": "   " }),
            json!({ "Axis": "Finance" }),
        ];
        let mapped = map_sheet_rows(rows.as_slice());
        assert_eq!(mapped.len(), 2);
        assert_eq!(mapped[0].id, "IND-1");
        assert_eq!(mapped[0].axis, "Governance");
        assert_eq!(mapped[0].text, "Has a board?");
        assert_eq!(mapped[1].id, "IND-2");
        assert_eq!(mapped[1].axis, SHEET_DEFAULT_AXIS);
        assert_eq!(mapped[1].text, "Keeps minutes?");
    }

    #[test]
    fn routes_gate_on_session_and_fall_back_to_dashboard() {
        assert_eq!(resolve_route("/institutions", false), "login");
        assert_eq!(resolve_route("/", true), "dashboard");
        assert_eq!(resolve_route("#/reports", true), "reports");
        assert_eq!(resolve_route("/improvements", true), "reports");
        assert_eq!(resolve_route("/settings", true), "settings");
        assert_eq!(resolve_route("/no-such-view", true), "dashboard");
    }

    #[test]
    fn upsert_replaces_in_place_and_appends_otherwise() {
        let (_dir, store) = test_store();
        store
            .upsert(seed_indicator("a", AXIS_GOVERNANCE, "First"))
            .unwrap();
        store
            .upsert(seed_indicator("b", AXIS_GOVERNANCE, "Second"))
            .unwrap();
        store
            .upsert(seed_indicator("a", AXIS_GOVERNANCE, "First edited"))
            .unwrap();
        let items = store.list::<Indicator>().unwrap();
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].id, "a");
        assert_eq!(items[0].text, "First edited");
        assert_eq!(items[1].id, "b");
    }

    #[test]
    fn delete_reports_whether_anything_was_removed() {
        let (_dir, store) = test_store();
        store
            .upsert(seed_indicator("a", AXIS_GOVERNANCE, "First"))
            .unwrap();
        assert!(store.delete::<Indicator>("a").unwrap());
        assert!(!store.delete::<Indicator>("a").unwrap());
        assert!(store.list::<Indicator>().unwrap().is_empty());
    }

    #[test]
    fn corrupt_collection_reads_as_empty() {
        let (_dir, store) = test_store();
        store.write_raw(INDICATORS_KEY, "{not json").unwrap();
        assert!(store.list::<Indicator>().unwrap().is_empty());
    }

    #[test]
    fn settings_default_when_missing_and_broadcast_on_save() {
        let (_dir, store) = test_store();
        assert_eq!(store.settings().unwrap(), Settings::default());

        let fired = Arc::new(AtomicUsize::new(0));
        let observer = Arc::clone(&fired);
        store.on_settings_changed(Box::new(move |_| {
            observer.fetch_add(1, Ordering::SeqCst);
        }));

        let saved = settings_save(
            &store,
            Settings {
                org_name: "  Awqaf Authority  ".to_string(),
                supervisor_name: "Lead Reviewer".to_string(),
                dark_mode: true,
            },
        )
        .unwrap();
        assert_eq!(saved.org_name, "Awqaf Authority");
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert_eq!(store.settings().unwrap(), saved);
    }

    #[test]
    fn login_requires_a_username_and_gates_routes() {
        let (_dir, store) = test_store();
        assert!(login(&store, from_json(json!({ "username": "  " }))).is_err());
        assert_eq!(
            route_resolve(&store, from_json(json!({ "path": "/institutions" }))).unwrap(),
            "login"
        );

        login(&store, from_json(json!({ "username": "reviewer" }))).unwrap();
        let info = session(&store).unwrap();
        assert!(info.authenticated);
        assert_eq!(info.user.as_deref(), Some("reviewer"));
        assert_eq!(
            route_resolve(&store, from_json(json!({ "path": "/institutions" }))).unwrap(),
            "institutions"
        );

        logout(&store).unwrap();
        assert!(!session(&store).unwrap().authenticated);
    }

    #[test]
    fn institution_save_fills_defaults_and_validates() {
        let (_dir, store) = test_store();
        assert!(institution_save(&store, from_json(json!({ "name": "  " }))).is_err());

        let saved = institution_save(
            &store,
            from_json(json!({
                "name": "  Al Khair Endowment  ",
                "governorate": "Muscat",
                "wilayat": "Bawshar",
                "capital_omr": 250000.0,
            })),
        )
        .unwrap();
        assert!(!saved.id.is_empty());
        assert!(!saved.created_at.is_empty());
        assert_eq!(saved.name, "Al Khair Endowment");
        assert_eq!(saved.kind, InstitutionKind::General);

        let relisted = institutions_list(&store).unwrap();
        assert_eq!(relisted.len(), 1);

        // Editing without resending documents keeps the stored ones.
        institution_attach_document(
            &store,
            from_json(json!({
                "institution_id": saved.id,
                "file_name": "license.pdf",
                "size_bytes": 2048.0,
            })),
        )
        .unwrap();
        let edited = institution_save(
            &store,
            from_json(json!({ "id": saved.id, "name": "Al Khair Endowment (renamed)" })),
        )
        .unwrap();
        assert_eq!(edited.documents.len(), 1);
        assert_eq!(edited.created_at, saved.created_at);
        assert_eq!(institutions_list(&store).unwrap().len(), 1);
    }

    #[test]
    fn wilayat_must_belong_to_the_selected_governorate() {
        let (_dir, store) = test_store();
        let unknown = institution_save(
            &store,
            from_json(json!({ "name": "X", "governorate": "Atlantis" })),
        );
        assert!(unknown.is_err());

        let mismatched = institution_save(
            &store,
            from_json(json!({ "name": "X", "governorate": "Muscat", "wilayat": "Salalah" })),
        );
        assert!(mismatched.is_err());

        let orphan_wilayat =
            institution_save(&store, from_json(json!({ "name": "X", "wilayat": "Bawshar" })));
        assert!(orphan_wilayat.is_err());
    }

    #[test]
    fn deleting_an_institution_leaves_its_records_behind() {
        let (_dir, store) = test_store();
        let institution = add_institution(&store, "Al Khair");
        let evaluation = evaluation_open(
            &store,
            from_json(json!({ "institution_id": institution.id })),
        )
        .unwrap();

        assert!(institution_delete(&store, from_json(json!({ "id": institution.id }))).unwrap());
        assert!(institutions_list(&store).unwrap().is_empty());
        let evaluations = store.list::<Evaluation>().unwrap();
        assert_eq!(evaluations.len(), 1);
        assert_eq!(evaluations[0].id, evaluation.id);
    }

    #[test]
    fn evaluation_open_is_idempotent_per_institution_and_year() {
        let (_dir, store) = test_store();
        assert!(evaluation_open(&store, from_json(json!({ "institution_id": "ghost" }))).is_err());

        let institution = add_institution(&store, "Al Khair");
        let first = evaluation_open(
            &store,
            from_json(json!({ "institution_id": institution.id, "cycle_year": 2026 })),
        )
        .unwrap();
        assert_eq!(first.status, EvaluationStatus::Draft);

        let again = evaluation_open(
            &store,
            from_json(json!({ "institution_id": institution.id, "cycle_year": 2026 })),
        )
        .unwrap();
        assert_eq!(again.id, first.id);

        let next_year = evaluation_open(
            &store,
            from_json(json!({ "institution_id": institution.id, "cycle_year": 2027 })),
        )
        .unwrap();
        assert_ne!(next_year.id, first.id);
        assert_eq!(store.list::<Evaluation>().unwrap().len(), 2);
    }

    #[test]
    fn response_set_upserts_per_evaluation_and_indicator() {
        let (_dir, store) = test_store();
        assert!(response_set(
            &store,
            from_json(json!({ "evaluation_id": "e1", "indicator_id": "a", "score": 0.5 })),
        )
        .is_err());
        assert!(response_set(
            &store,
            from_json(json!({ "evaluation_id": "e1", "indicator_id": "a", "score": 5.5 })),
        )
        .is_err());

        response_set(
            &store,
            from_json(json!({ "evaluation_id": "e1", "indicator_id": "a", "score": 2.0 })),
        )
        .unwrap();
        let updated = response_set(
            &store,
            from_json(json!({ "evaluation_id": "e1", "indicator_id": "a", "score": 4.0 })),
        )
        .unwrap();
        assert_eq!(updated.score, 4.0);
        assert_eq!(store.list::<Response>().unwrap().len(), 1);

        response_set(
            &store,
            from_json(json!({ "evaluation_id": "e2", "indicator_id": "a", "score": 3.0 })),
        )
        .unwrap();
        assert_eq!(store.list::<Response>().unwrap().len(), 2);

        let keyed = responses_list(&store, from_json(json!({ "evaluation_id": "e1" }))).unwrap();
        assert_eq!(keyed.len(), 1);
        assert_eq!(keyed.get("a").unwrap().score, 4.0);
    }

    #[test]
    fn indicators_seed_lazily_from_the_default_catalog() {
        let (_dir, store) = test_store();
        let indicators = indicators_list(&store).unwrap();
        assert_eq!(indicators.len(), 30);
        let mut axes: Vec<&str> = Vec::new();
        for indicator in &indicators {
            if !axes.contains(&indicator.axis.as_str()) {
                axes.push(indicator.axis.as_str());
            }
        }
        assert_eq!(axes.len(), 5);
        // Seeding persisted the catalog, so the next read hits storage.
        assert_eq!(store.list::<Indicator>().unwrap().len(), 30);
    }

    #[test]
    fn manual_indicators_are_added_and_removed() {
        let (_dir, store) = test_store();
        assert!(indicator_add(&store, from_json(json!({ "axis": "", "text": "x" }))).is_err());
        let added = indicator_add(
            &store,
            from_json(json!({ "axis": "Governance", "text": "Has a whistleblowing channel?" })),
        )
        .unwrap();
        assert!(added.id.starts_with("IND-MANUAL-"));
        assert_eq!(indicators_list(&store).unwrap().len(), 31);

        assert!(indicator_remove(&store, from_json(json!({ "id": added.id }))).unwrap());
        assert_eq!(indicators_list(&store).unwrap().len(), 30);
    }

    #[test]
    fn sheet_import_replaces_the_catalog_or_fails_leaving_it_intact() {
        let (_dir, store) = test_store();
        assert_eq!(indicators_list(&store).unwrap().len(), 30);

        let empty = indicators_import_rows(
            &store,
            from_json(json!({ "rows": [{ "Axis": "Finance" }] })),
        );
        assert!(empty.is_err());
        assert_eq!(indicators_list(&store).unwrap().len(), 30);

        let imported = indicators_import_rows(
            &store,
            from_json(json!({ "rows": [
                { "Axis": "Finance", "Question": "Budget approved?" },
                { "Indicator": "Assets registered?" },
            ]})),
        )
        .unwrap();
        assert_eq!(imported, 2);
        let catalog = indicators_list(&store).unwrap();
        assert_eq!(catalog.len(), 2);
        assert_eq!(catalog[0].id, "IND-1");
    }

    #[test]
    fn compliance_defaults_then_saves_per_institution_and_year() {
        let (_dir, store) = test_store();
        let fresh = compliance_get(
            &store,
            from_json(json!({ "institution_id": "i1", "cycle_year": 2026 })),
        )
        .unwrap();
        assert!(fresh.id.is_empty());
        // All four governance flags default to unmet: 2 + 2 + 2 + 1.
        assert_eq!(compliance_risk_score(&fresh).0, 7);

        let saved = compliance_save(
            &store,
            from_json(json!({
                "institution_id": "i1",
                "cycle_year": 2026,
                "has_executive_management": true,
                "has_auditor_company": true,
                "has_minutes_prev_year": true,
                "has_financial_report_prev_year": true,
            })),
        )
        .unwrap();
        assert_eq!(saved["risk"]["score"], json!(0));
        assert_eq!(saved["risk"]["label"], json!("Low"));

        // Saving again without an id reuses the (institution, year) record.
        compliance_save(
            &store,
            from_json(json!({ "institution_id": "i1", "cycle_year": 2026 })),
        )
        .unwrap();
        assert_eq!(store.list::<ComplianceRecord>().unwrap().len(), 1);

        let reloaded = compliance_get(
            &store,
            from_json(json!({ "institution_id": "i1", "cycle_year": 2026 })),
        )
        .unwrap();
        assert!(!reloaded.id.is_empty());
        assert!(!reloaded.last_updated_at.is_empty());
    }

    #[test]
    fn risk_save_clamps_ratings_and_lists_carry_tiers() {
        let (_dir, store) = test_store();
        assert!(risk_save(&store, from_json(json!({ "risk_title": "Untied" }))).is_err());

        let saved = risk_save(
            &store,
            from_json(json!({
                "institution_id": "i1",
                "risk_title": "Deed documents missing",
                "probability": 9,
                "impact": 0,
            })),
        )
        .unwrap();
        assert_eq!(saved.item.probability, 5);
        assert_eq!(saved.item.impact, 1);
        assert_eq!(saved.item.category, RiskCategory::Operational);
        assert_eq!(saved.tier, "Low");

        risk_save(
            &store,
            from_json(json!({
                "institution_id": "i2",
                "risk_title": "Fund misallocation",
                "category": "financial",
                "probability": 4,
                "impact": 4,
            })),
        )
        .unwrap();

        let all = risks_list(&store, from_json(json!({}))).unwrap();
        assert_eq!(all.len(), 2);
        let filtered =
            risks_list(&store, from_json(json!({ "institution_id": "i2" }))).unwrap();
        assert_eq!(filtered.len(), 1);
        assert_eq!(filtered[0].tier, "High");
        assert_eq!(filtered[0].severity, 16);

        assert!(risk_delete(&store, from_json(json!({ "id": saved.item.id }))).unwrap());
        assert_eq!(risks_list(&store, from_json(json!({}))).unwrap().len(), 1);
    }

    #[test]
    fn improvements_generate_appends_once_and_keeps_stale_items() {
        let (_dir, store) = test_store();
        let institution = add_institution(&store, "Al Khair");
        let evaluation = evaluation_open(
            &store,
            from_json(json!({ "institution_id": institution.id })),
        )
        .unwrap();
        let indicators = indicators_list(&store).unwrap();
        response_set(
            &store,
            from_json(json!({
                "evaluation_id": evaluation.id,
                "indicator_id": indicators[0].id,
                "score": 2.0,
            })),
        )
        .unwrap();

        let first = improvements_generate(
            &store,
            from_json(json!({ "evaluation_id": evaluation.id })),
        )
        .unwrap();
        assert_eq!(first["added"], json!(1));

        let second = improvements_generate(
            &store,
            from_json(json!({ "evaluation_id": evaluation.id })),
        )
        .unwrap();
        assert_eq!(second["added"], json!(0));

        // Rescoring above the threshold does not retire the item.
        response_set(
            &store,
            from_json(json!({
                "evaluation_id": evaluation.id,
                "indicator_id": indicators[0].id,
                "score": 5.0,
            })),
        )
        .unwrap();
        let third = improvements_generate(
            &store,
            from_json(json!({ "evaluation_id": evaluation.id })),
        )
        .unwrap();
        assert_eq!(third["added"], json!(0));
        let remaining = improvements_list(
            &store,
            from_json(json!({ "evaluation_id": evaluation.id })),
        )
        .unwrap();
        assert_eq!(remaining.len(), 1);
    }

    #[test]
    fn report_model_filters_orphans_and_tallies_priorities() {
        let (_dir, store) = test_store();
        let institution = add_institution(&store, "Al Khair");
        assert!(report_model(
            &store,
            from_json(json!({ "institution_id": institution.id })),
        )
        .is_err());

        let evaluation = evaluation_open(
            &store,
            from_json(json!({ "institution_id": institution.id })),
        )
        .unwrap();
        let indicators = indicators_list(&store).unwrap();
        let first_axis = indicators[0].axis.clone();
        response_set(
            &store,
            from_json(json!({
                "evaluation_id": evaluation.id,
                "indicator_id": indicators[0].id,
                "score": 4.0,
            })),
        )
        .unwrap();
        response_set(
            &store,
            from_json(json!({
                "evaluation_id": evaluation.id,
                "indicator_id": indicators[1].id,
                "score": 2.0,
            })),
        )
        .unwrap();
        // Orphaned response from a removed indicator.
        response_set(
            &store,
            from_json(json!({
                "evaluation_id": evaluation.id,
                "indicator_id": "ghost",
                "score": 5.0,
            })),
        )
        .unwrap();

        let report = report_model(
            &store,
            from_json(json!({ "institution_id": institution.id })),
        )
        .unwrap();
        assert_eq!(report.evaluation.id, evaluation.id);
        assert_eq!(report.axis_scores.len(), 5);
        let axis = report
            .axis_scores
            .iter()
            .find(|score| score.axis == first_axis)
            .unwrap();
        assert_eq!(axis.answered, 2);
        assert_eq!(axis.average, 3.0);
        assert_eq!(report.improvements.len(), 1);
        assert_eq!(report.priorities.high, 1);
        assert_eq!(report.priorities.medium, 0);
    }

    #[test]
    fn dashboard_aggregates_capital_bands_and_top_scores() {
        let (_dir, store) = test_store();
        let small = institution_save(
            &store,
            from_json(json!({
                "name": "Small",
                "capital_omr": 50_000.0,
                "employees_omani": 4,
                "employees_non_omani": 1,
                "governorate": "Muscat",
                "wilayat": "Bawshar",
            })),
        )
        .unwrap();
        let medium = institution_save(
            &store,
            from_json(json!({ "name": "Medium", "capital_omr": 500_000.0, "governorate": "Dhofar" })),
        )
        .unwrap();
        institution_save(
            &store,
            from_json(json!({ "name": "Large", "capital_omr": 2_000_000.0 })),
        )
        .unwrap();

        let eval_small = evaluation_open(
            &store,
            from_json(json!({ "institution_id": small.id, "cycle_year": 2026 })),
        )
        .unwrap();
        let eval_medium = evaluation_open(
            &store,
            from_json(json!({ "institution_id": medium.id, "cycle_year": 2026 })),
        )
        .unwrap();
        for (evaluation_id, indicator_id, score) in [
            (eval_small.id.as_str(), "a", 4.0),
            (eval_small.id.as_str(), "b", 5.0),
            (eval_medium.id.as_str(), "a", 2.0),
        ] {
            response_set(
                &store,
                from_json(json!({
                    "evaluation_id": evaluation_id,
                    "indicator_id": indicator_id,
                    "score": score,
                })),
            )
            .unwrap();
        }
        risk_save(
            &store,
            from_json(json!({
                "institution_id": small.id,
                "risk_title": "Unrecorded assets",
                "probability": 4,
                "impact": 4,
            })),
        )
        .unwrap();
        compliance_save(
            &store,
            from_json(json!({ "institution_id": small.id, "cycle_year": 2026 })),
        )
        .unwrap();

        let model = dashboard_model(&store).unwrap();
        assert_eq!(model.institution_count, 3);
        assert_eq!(model.total_capital_omr, 2_550_000.0);
        assert_eq!(model.employees_omani, 4);
        assert_eq!(model.employees_non_omani, 1);
        assert_eq!(model.capital_bands.small, 1);
        assert_eq!(model.capital_bands.medium, 1);
        assert_eq!(model.capital_bands.large, 1);
        assert_eq!(model.governorate_counts.len(), 2);
        assert_eq!(model.average_score, round2(11.0 / 3.0));
        assert_eq!(model.top_institutions.len(), 2);
        assert_eq!(model.top_institutions[0].institution_id, small.id);
        assert_eq!(model.top_institutions[0].average, 4.5);
        assert_eq!(model.risk_matrix.high, 1);
        assert_eq!(model.compliance.len(), 1);
        assert_eq!(model.compliance[0].name, "Small");
    }

    #[test]
    fn backup_round_trips_into_a_fresh_store() {
        let (_dir, store) = test_store();
        let institution = add_institution(&store, "Al Khair");
        login(&store, from_json(json!({ "username": "reviewer" }))).unwrap();

        let document = backup_export(&store).unwrap();
        let encoded = serde_json::to_string(&document).unwrap();

        let (_dir2, restored) = test_store();
        let written = backup_import(&restored, from_json(json!({ "data": encoded }))).unwrap();
        assert!(written >= 2);
        let institutions = institutions_list(&restored).unwrap();
        assert_eq!(institutions.len(), 1);
        assert_eq!(institutions[0].id, institution.id);
        assert_eq!(
            restored.session_user().unwrap().as_deref(),
            Some("reviewer")
        );
    }

    #[test]
    fn backup_import_rejects_bad_documents_without_touching_state() {
        let (_dir, store) = test_store();
        add_institution(&store, "Al Khair");

        assert!(backup_import(&store, from_json(json!({ "data": "{broken" }))).is_err());
        assert!(backup_import(&store, from_json(json!({ "data": "[1,2]" }))).is_err());
        assert!(backup_import(
            &store,
            from_json(json!({ "data": "{\"waqf_institutions\": 7}" })),
        )
        .is_err());
        assert_eq!(institutions_list(&store).unwrap().len(), 1);
    }

    #[test]
    fn encrypted_backup_round_trips_and_rejects_a_wrong_password() {
        let (_dir, store) = test_store();
        add_institution(&store, "Al Khair");

        let envelope = backup_export_encrypted(
            &store,
            from_json(json!({ "password": "correct horse" })),
        )
        .unwrap();

        let (_dir2, restored) = test_store();
        let wrong = backup_import_encrypted(
            &restored,
            from_json(json!({ "password": "wrong", "data": envelope })),
        );
        assert_eq!(
            wrong.unwrap_err(),
            "Unable to decrypt the backup file. Check the password."
        );
        assert!(institutions_list(&restored).unwrap().is_empty());

        backup_import_encrypted(
            &restored,
            from_json(json!({ "password": "correct horse", "data": envelope })),
        )
        .unwrap();
        assert_eq!(institutions_list(&restored).unwrap().len(), 1);
    }

    #[test]
    fn clear_all_removes_every_collection_and_the_session() {
        let (_dir, store) = test_store();
        add_institution(&store, "Al Khair");
        login(&store, from_json(json!({ "username": "reviewer" }))).unwrap();

        clear_all_data(&store).unwrap();
        assert!(institutions_list(&store).unwrap().is_empty());
        assert!(store.session_user().unwrap().is_none());
    }

    #[test]
    fn document_ref_formats_size_and_upload_date() {
        let document = document_ref("license.pdf", "application/pdf", 2048.0);
        assert_eq!(document.size, "2.0 KB");
        assert_eq!(document.upload_date, today_string());
        assert!(!document.id.is_empty());
    }

    #[test]
    fn dispatch_routes_by_command_name() {
        let (_dir, store) = test_store();
        let result = dispatch(&store, "settings_get", json!({})).unwrap();
        assert_eq!(result["org_name"], json!(default_org_name()));
        assert!(dispatch(&store, "no_such_command", json!({})).is_err());
    }
}
