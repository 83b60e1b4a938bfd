//! Payment receipt verification.
//!
//! Receipt screenshots are stored under the media directory, read with the
//! Tesseract engine and checked for the markers of a completed mobile money
//! payment to the configured merchant.

use std::path::Path;
use std::sync::LazyLock;

use axum::extract::{DefaultBodyLimit, Multipart, Query, State};
use axum::Json;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tokio::process::Command;
use utoipa::ToSchema;
use utoipa_axum::router::OpenApiRouter;
use utoipa_axum::routes;
use uuid::Uuid;

use crate::auth::Claims;
use crate::error::ApiError;
use crate::RECEIPTS_TAG;

const RESOURCE: &str = "receipts";
const DEFAULT_EXPECTED_AMOUNT: f64 = 7000.0;
const MAX_UPLOAD_BYTES: usize = 10 * 1024 * 1024;
const DEBUG_TEXT_CHARS: usize = 1000;

/// Either grouped thousands (`7.000`, `7 000`) or a bare run of digits (`7000`).
const AMOUNT: &str = r"-?(?:[0-9]{1,3}(?:[ .,][0-9]{3})+|[0-9]+)";

static AMOUNT_NEAR_LABEL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(&format!(r"(?:montant|amount|paiement)[^\d-]{{0,20}}({AMOUNT})f")).unwrap()
});
static AMOUNT_HEADLINE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(&format!("^({AMOUNT})f")).unwrap());
static AMOUNT_ANY: LazyLock<Regex> = LazyLock::new(|| Regex::new(AMOUNT).unwrap());
static TX_PREFIX: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\bT[._]([A-Z0-9])").unwrap());
static TX_ID: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"[A-Z0-9]{15,20}").unwrap());
static COMPLETED: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)C[0O]MP[1LI][E3]T[E3]D|[E3]FF[E3]CTU[ÉE]").unwrap()
});
static PROVIDER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)WAVE|NET\s*AM[0O]UNT|ORABANK|\bUBA\b").unwrap()
});

pub fn receipt_router() -> OpenApiRouter<crate::State> {
    OpenApiRouter::new()
        .routes(routes!(verify_receipt))
        .layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES))
}

/// Thin wrapper over the `tesseract` command line.
pub struct Tesseract<'a> {
    pub command: &'a str,
    pub langs: &'a str,
}

impl Tesseract<'_> {
    pub async fn read_text(&self, image: &Path) -> Result<String, ApiError> {
        let output = Command::new(self.command)
            .arg(image)
            .arg("stdout")
            .arg("-l")
            .arg(self.langs)
            .output()
            .await
            .map_err(|e| ApiError::Ocr(format!("cannot run {}: {}", self.command, e)))?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(ApiError::Ocr(stderr.trim().to_string()));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

/// Parses an amount such as `7.000`, `7 000` or `1,250.50`.
pub fn normalize_amount(raw: &str) -> Option<f64> {
    let mut cleaned: String = raw.chars().filter(|c| !c.is_whitespace()).collect();
    if cleaned.contains(',') && cleaned.contains('.') {
        cleaned = cleaned.replace(',', "");
    } else if cleaned.contains(',') {
        cleaned = cleaned.replace('.', "").replace(',', ".");
    } else {
        cleaned = cleaned.replace('.', "");
    }
    cleaned.replace('-', "").parse().ok()
}

/// Finds the paid amount: a figure next to an amount label first, then the
/// headline figure, then the figure in the usual fee range, then the largest.
pub fn extract_amount(text: &str) -> Option<f64> {
    let text = text.replace(['\u{a0}', '\u{202f}'], " ").to_lowercase();
    for pattern in [&*AMOUNT_NEAR_LABEL, &*AMOUNT_HEADLINE] {
        if let Some(found) = pattern.captures(&text).and_then(|c| c.get(1)) {
            return normalize_amount(found.as_str());
        }
    }

    let candidates: Vec<f64> = AMOUNT_ANY
        .find_iter(&text)
        .filter_map(|m| normalize_amount(m.as_str()))
        .filter(|v| *v != 0.0)
        .collect();
    candidates
        .iter()
        .copied()
        .filter(|v| (2000.0..=20000.0).contains(&v.abs()))
        .min_by(|a, b| a.abs().total_cmp(&b.abs()))
        .or_else(|| candidates.iter().copied().max_by(f64::total_cmp))
        .map(f64::abs)
}

/// Transaction ids are 15 to 20 uppercase alphanumerics starting with `T`.
pub fn extract_transaction_id(text: &str) -> Option<String> {
    text.lines()
        .map(|line| {
            let compact: String = line.chars().filter(|c| !c.is_whitespace()).collect();
            TX_PREFIX.replace_all(&compact, "T$1").into_owned()
        })
        .find_map(|line| {
            TX_ID
                .find_iter(&line)
                .map(|m| m.as_str())
                .find(|candidate| candidate.starts_with('T'))
                .map(str::to_owned)
        })
}

pub fn is_completed(text: &str) -> bool {
    COMPLETED.is_match(text)
}

pub fn is_provider_receipt(text: &str) -> bool {
    PROVIDER.is_match(text)
}

fn compact_upper(text: &str) -> String {
    text.chars()
        .filter(|c| !c.is_whitespace())
        .map(|c| match c.to_ascii_uppercase() {
            '0' => 'O',
            other => other,
        })
        .collect()
}

/// OCR often drops spaces and confuses `O` with `0`.
pub fn mentions_merchant(text: &str, merchant: &str) -> bool {
    let merchant = compact_upper(merchant);
    !merchant.is_empty() && compact_upper(text).contains(&merchant)
}

#[derive(Debug, Serialize, ToSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ReceiptChecks {
    pub has_transaction_id: bool,
    pub has_correct_amount: bool,
    pub has_merchant: bool,
    pub has_status: bool,
    pub is_provider_receipt: bool,
}

#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ReceiptAnalysis {
    pub is_valid: bool,
    /// 0 to 100.
    pub score: u8,
    pub amount: Option<f64>,
    pub transaction_id: Option<String>,
    pub checks: ReceiptChecks,
    pub errors: Vec<String>,
    pub debug_text: String,
}

pub fn analyze(text: &str, expected_amount: f64, merchant: &str) -> ReceiptAnalysis {
    let amount = extract_amount(text);
    let transaction_id = extract_transaction_id(text);
    let checks = ReceiptChecks {
        has_transaction_id: transaction_id.is_some(),
        has_correct_amount: amount.is_some_and(|a| (a - expected_amount).abs() < 0.5),
        has_merchant: mentions_merchant(text, merchant),
        has_status: is_completed(text),
        is_provider_receipt: is_provider_receipt(text),
    };

    let weighted = [
        (checks.has_transaction_id, 30),
        (checks.has_correct_amount, 30),
        (checks.has_merchant, 20),
        (checks.has_status, 15),
        (checks.is_provider_receipt, 5),
    ];
    let score = weighted
        .iter()
        .filter(|(passed, _)| *passed)
        .map(|(_, weight)| weight)
        .sum();

    let mut errors = Vec::new();
    if !checks.has_transaction_id {
        errors.push("Transaction id missing or unreadable".to_string());
    }
    if !checks.has_correct_amount {
        match amount {
            Some(paid) => errors.push(format!(
                "Wrong amount: {paid}F paid, {expected_amount}F expected"
            )),
            None => errors.push(format!("Amount unreadable, {expected_amount}F expected")),
        }
    }
    if !checks.has_merchant {
        errors.push(format!("Payee is not {merchant}"));
    }
    if !checks.has_status {
        errors.push("Payment is not marked completed".to_string());
    }
    if !checks.is_provider_receipt {
        errors.push("Not a mobile money receipt".to_string());
    }

    ReceiptAnalysis {
        is_valid: errors.is_empty(),
        score,
        amount,
        transaction_id,
        checks,
        errors,
        debug_text: text.chars().take(DEBUG_TEXT_CHARS).collect(),
    }
}

fn extension_for(content_type: &str) -> &'static str {
    match content_type {
        "image/png" => "png",
        "image/jpeg" | "image/jpg" => "jpg",
        "image/webp" => "webp",
        "image/tiff" => "tiff",
        _ => "img",
    }
}

#[derive(Deserialize)]
struct ExpectedAmount {
    expected_amount: Option<f64>,
}

#[derive(ToSchema)]
#[allow(dead_code)]
struct ReceiptUpload {
    #[schema(value_type = String, format = Binary)]
    file: Vec<u8>,
}

/// Verify payment receipt
#[utoipa::path(
    post,
    path = "/receipts/verify",
    request_body(content = ReceiptUpload, content_type = "multipart/form-data"),
    responses((status = OK, body = ReceiptAnalysis), (status = BAD_REQUEST)),
    tag = RECEIPTS_TAG,
    params(
        ("expected_amount" = Option<f64>, Query, description = "Amount due, 7000 by default"),
    ),
    security(
        ("jwt" = [])
    )
)]
async fn verify_receipt(
    claims: Claims,
    State(crate::State {
        enforcer, settings, ..
    }): State<crate::State>,
    Query(ExpectedAmount { expected_amount }): Query<ExpectedAmount>,
    mut multipart: Multipart,
) -> Result<Json<ReceiptAnalysis>, ApiError> {
    claims.require(&enforcer, RESOURCE, "create")?;

    let mut upload = None;
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::BadRequest(e.to_string()))?
    {
        if field.name() != Some("file") {
            continue;
        }
        let content_type = field.content_type().unwrap_or_default().to_owned();
        if !content_type.starts_with("image/") {
            return Err(ApiError::BadRequest("The file must be an image".to_string()));
        }
        let bytes = field
            .bytes()
            .await
            .map_err(|e| ApiError::BadRequest(e.to_string()))?;
        upload = Some((content_type, bytes));
        break;
    }
    let (content_type, bytes) =
        upload.ok_or_else(|| ApiError::BadRequest("Missing `file` field".to_string()))?;

    let dir = settings.media_dir.join("receipts");
    let path = dir.join(format!("{}.{}", Uuid::new_v4(), extension_for(&content_type)));
    tokio::fs::create_dir_all(&dir).await.map_err(|e| {
        tracing::error!("create {}: {}", dir.display(), e);
        ApiError::Internal
    })?;
    tokio::fs::write(&path, &bytes).await.map_err(|e| {
        tracing::error!("write {}: {}", path.display(), e);
        ApiError::Internal
    })?;

    let text = Tesseract {
        command: &settings.tesseract_cmd,
        langs: &settings.tesseract_langs,
    }
    .read_text(&path)
    .await?;

    let expected = expected_amount.unwrap_or(DEFAULT_EXPECTED_AMOUNT);
    let analysis = analyze(&text, expected, &settings.receipt_merchant);
    tracing::info!(
        "receipt {} checked by {}: score {}, valid {}",
        path.display(),
        claims.username,
        analysis.score,
        analysis.is_valid
    );
    Ok(Json(analysis))
}

#[cfg(test)]
mod tests {
    use super::*;

    const RECEIPT: &str = "-7.000F\nWave\nSold to AN-NOUR\nAmount 7.000F\nTransaction ID\nT.V4FVURZFR0PGF3MQ\nStatus Completed\n";

    #[test]
    fn amounts_in_local_formats() {
        assert_eq!(normalize_amount("7.000"), Some(7000.0));
        assert_eq!(normalize_amount("7 000"), Some(7000.0));
        assert_eq!(normalize_amount("1,250.50"), Some(1250.5));
        assert_eq!(normalize_amount("12,5"), Some(12.5));
        assert_eq!(normalize_amount("-6.000"), Some(6000.0));
        assert_eq!(normalize_amount("abc"), None);
    }

    #[test]
    fn amount_next_to_label_wins() {
        assert_eq!(extract_amount("Solde 150.000F\nMontant : 7.000F"), Some(7000.0));
    }

    #[test]
    fn ungrouped_amounts() {
        assert_eq!(extract_amount("-7000F\nWave"), Some(7000.0));
        assert_eq!(extract_amount("Montant: 7000F"), Some(7000.0));
        assert_eq!(extract_amount("total 6500 solde 45000"), Some(6500.0));
    }

    #[test]
    fn headline_amount() {
        assert_eq!(extract_amount("-6.000F\nFrais 0F"), Some(6000.0));
    }

    #[test]
    fn falls_back_to_fee_range_then_largest() {
        assert_eq!(extract_amount("ref 12 total 7 000 solde 45.000"), Some(7000.0));
        assert_eq!(extract_amount("ref 12 solde 45.000"), Some(45000.0));
        assert_eq!(extract_amount("nothing here"), None);
    }

    #[test]
    fn transaction_id_with_dotted_prefix() {
        assert_eq!(
            extract_transaction_id(RECEIPT).as_deref(),
            Some("TV4FVURZFR0PGF3MQ")
        );
        assert_eq!(extract_transaction_id("ID XV4FVURZFR0PGF3MQ"), None);
    }

    #[test]
    fn noisy_status_and_provider() {
        assert!(is_completed("Statut: C0mp1eted"));
        assert!(is_completed("Paiement effectué"));
        assert!(!is_completed("Pending"));
        assert!(is_provider_receipt("WaveFeeAm0unt"));
        assert!(!is_provider_receipt("Cuba libre"));
    }

    #[test]
    fn merchant_tolerates_ocr_noise() {
        assert!(mentions_merchant("S01d to AN - N0UR", "AN-NOUR"));
        assert!(!mentions_merchant("Sold to Boutique", "AN-NOUR"));
        assert!(!mentions_merchant("anything", ""));
    }

    #[test]
    fn full_receipt_is_valid() {
        let analysis = analyze(RECEIPT, 7000.0, "AN-NOUR");
        assert!(analysis.is_valid, "{:?}", analysis.errors);
        assert_eq!(analysis.score, 100);
        assert_eq!(analysis.amount, Some(7000.0));
    }

    #[test]
    fn wrong_amount_is_reported() {
        let analysis = analyze(RECEIPT, 10000.0, "AN-NOUR");
        assert!(!analysis.is_valid);
        assert_eq!(analysis.score, 70);
        assert!(!analysis.checks.has_correct_amount);
        assert_eq!(analysis.errors.len(), 1);
    }

    #[test]
    fn extensions() {
        assert_eq!(extension_for("image/png"), "png");
        assert_eq!(extension_for("image/jpeg"), "jpg");
        assert_eq!(extension_for("image/bmp"), "img");
    }
}
