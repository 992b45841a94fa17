//! 病変クラスの分類体系
//!
//! 学習時のラベルIDと推論時のクラス参照はこの列挙型だけを通して行います。
//! IDは0..=7の閉じた空間で、実行時に拡張されることはありません。

use serde::{Deserialize, Serialize};

/// クラス数
pub const NUM_CLASSES: usize = 8;

/// 表形式データ（HMNIST）が持つクラス数（非がんクラスを除く）
pub const NUM_TABULAR_CLASSES: usize = 7;

/// 病変クラス
///
/// 判別値がそのままモデル出力のインデックスになります。
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LesionClass {
    Akiec = 0,
    Bcc = 1,
    Bkl = 2,
    Df = 3,
    Nv = 4,
    Vasc = 5,
    Mel = 6,
    /// ディレクトリ由来の「がんなし」クラス
    Nc = 7,
}

/// 臨床的な緊急度
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    None,
    Low,
    Moderate,
    High,
    Critical,
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Severity::None => write!(f, "none"),
            Severity::Low => write!(f, "low"),
            Severity::Moderate => write!(f, "moderate"),
            Severity::High => write!(f, "high"),
            Severity::Critical => write!(f, "critical"),
        }
    }
}

/// 分類情報API向けの1エントリ
#[derive(Debug, Clone, Serialize)]
pub struct TaxonomyEntry {
    pub id: usize,
    pub code: &'static str,
    pub name: &'static str,
    pub severity: Severity,
    pub description: &'static str,
    pub recommendation: &'static str,
}

impl LesionClass {
    /// 正準順（ID順）の全クラス
    pub const ALL: [LesionClass; NUM_CLASSES] = [
        LesionClass::Akiec,
        LesionClass::Bcc,
        LesionClass::Bkl,
        LesionClass::Df,
        LesionClass::Nv,
        LesionClass::Vasc,
        LesionClass::Mel,
        LesionClass::Nc,
    ];

    /// 非がんクラス
    pub const NON_CANCER: LesionClass = LesionClass::Nc;

    pub fn id(self) -> usize {
        self as usize
    }

    pub fn from_id(id: usize) -> Option<Self> {
        Self::ALL.get(id).copied()
    }

    /// 表形式データ由来のクラスかどうか
    pub fn is_tabular(self) -> bool {
        self != Self::NON_CANCER
    }

    /// HAM10000の略号
    pub fn code(self) -> &'static str {
        match self {
            LesionClass::Akiec => "akiec",
            LesionClass::Bcc => "bcc",
            LesionClass::Bkl => "bkl",
            LesionClass::Df => "df",
            LesionClass::Nv => "nv",
            LesionClass::Vasc => "vasc",
            LesionClass::Mel => "mel",
            LesionClass::Nc => "nc",
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            LesionClass::Akiec => "Actinic keratoses and intraepithelial carcinomae",
            LesionClass::Bcc => "Basal Cell Carcinoma",
            LesionClass::Bkl => "Benign Keratosis",
            LesionClass::Df => "Dermatofibroma",
            LesionClass::Nv => "Melanocytic nevus",
            LesionClass::Vasc => "Vascular Lesion",
            LesionClass::Mel => "Melanoma",
            LesionClass::Nc => "No Cancer Detected",
        }
    }

    pub fn severity(self) -> Severity {
        match self {
            LesionClass::Akiec => Severity::Moderate,
            LesionClass::Bcc => Severity::High,
            LesionClass::Bkl | LesionClass::Df | LesionClass::Nv | LesionClass::Vasc => {
                Severity::Low
            }
            LesionClass::Mel => Severity::Critical,
            LesionClass::Nc => Severity::None,
        }
    }

    pub fn description(self) -> &'static str {
        match self {
            LesionClass::Akiec => {
                "Pre-cancerous skin condition that may develop into squamous cell carcinoma."
            }
            LesionClass::Bcc => {
                "The most common form of skin cancer, grows slowly and rarely spreads."
            }
            LesionClass::Bkl => "Non-cancerous growth, usually harmless but should be monitored.",
            LesionClass::Df => "Benign fibrous nodule, generally harmless.",
            LesionClass::Nv => "Common mole, typically benign but should be monitored.",
            LesionClass::Vasc => "Abnormality of blood vessels, usually benign.",
            LesionClass::Mel => "Most dangerous form of skin cancer. Early detection is crucial.",
            LesionClass::Nc => "No signs of cancer detected in the analysis.",
        }
    }

    pub fn recommendation(self) -> &'static str {
        match self {
            LesionClass::Akiec => "Consult a dermatologist for evaluation and treatment.",
            LesionClass::Bcc => "Immediate medical consultation required for proper treatment.",
            LesionClass::Bkl => {
                "Regular monitoring recommended. Consult dermatologist if changes occur."
            }
            LesionClass::Df => "Usually no treatment needed unless causing discomfort.",
            LesionClass::Nv => {
                "Monitor for changes using ABCDE method. Annual checkup recommended."
            }
            LesionClass::Vasc => "Consult dermatologist if rapidly changing or bleeding.",
            LesionClass::Mel => "URGENT: Immediate consultation with dermatologist required.",
            LesionClass::Nc => {
                "Continue regular self-examinations and annual dermatologist visits."
            }
        }
    }

    pub fn entry(self) -> TaxonomyEntry {
        TaxonomyEntry {
            id: self.id(),
            code: self.code(),
            name: self.name(),
            severity: self.severity(),
            description: self.description(),
            recommendation: self.recommendation(),
        }
    }

    /// 正準順の略号一覧（アーティファクトのクラス空間検証に使用）
    pub fn canonical_codes() -> Vec<String> {
        Self::ALL.iter().map(|c| c.code().to_string()).collect()
    }
}

impl std::fmt::Display for LesionClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.code(), self.name())
    }
}

/// 分類体系全体をID順で返す
pub fn taxonomy() -> Vec<TaxonomyEntry> {
    LesionClass::ALL.iter().map(|c| c.entry()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ids_follow_canonical_order() {
        for (i, class) in LesionClass::ALL.iter().enumerate() {
            assert_eq!(class.id(), i);
            assert_eq!(LesionClass::from_id(i), Some(*class));
        }
        assert_eq!(LesionClass::from_id(NUM_CLASSES), None);
    }

    #[test]
    fn test_tabular_classes_match_hmnist_labels() {
        // HMNISTのラベル: 4=nv, 6=mel
        assert_eq!(LesionClass::from_id(4), Some(LesionClass::Nv));
        assert_eq!(LesionClass::from_id(6), Some(LesionClass::Mel));
        let tabular = LesionClass::ALL.iter().filter(|c| c.is_tabular()).count();
        assert_eq!(tabular, NUM_TABULAR_CLASSES);
        assert!(!LesionClass::Nc.is_tabular());
    }

    #[test]
    fn test_taxonomy_has_eight_entries() {
        let entries = taxonomy();
        assert_eq!(entries.len(), NUM_CLASSES);
        assert_eq!(entries[6].severity, Severity::Critical);
        assert_eq!(entries[7].severity, Severity::None);
        assert_eq!(entries[1].name, "Basal Cell Carcinoma");
    }

    #[test]
    fn test_severity_serializes_lowercase() {
        let json = serde_json::to_string(&Severity::Moderate).unwrap();
        assert_eq!(json, "\"moderate\"");
        assert_eq!(format!("{}", Severity::Critical), "critical");
    }
}
