//! Anonymized interaction keys for the shared result cache.
//!
//! Raw interactions never reach the cache: products are collapsed to coarse
//! categories, satisfaction to buckets, and location to a region code, and
//! the key is a truncated SHA-256 over that reduced tuple.  Two users buying
//! milk in the same region with the same priority and a similar outcome
//! produce the same key.

use sha2::{Digest, Sha256};

use crate::anonymize::{LocationAnonymizer, Precision, RegionCode};
use crate::{Decision, Interaction};

/// Coarse product categories used for anonymization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ProductCategory {
    Lacteos,
    Panaderia,
    Carnes,
    FrutasVerduras,
    Abarrotes,
    Limpieza,
    Bebidas,
    Otros,
}

impl ProductCategory {
    pub fn as_str(self) -> &'static str {
        match self {
            ProductCategory::Lacteos => "lacteos",
            ProductCategory::Panaderia => "panaderia",
            ProductCategory::Carnes => "carnes",
            ProductCategory::FrutasVerduras => "frutas_verduras",
            ProductCategory::Abarrotes => "abarrotes",
            ProductCategory::Limpieza => "limpieza",
            ProductCategory::Bebidas => "bebidas",
            ProductCategory::Otros => "otros",
        }
    }
}

const CATEGORY_KEYWORDS: [(ProductCategory, &[&str]); 7] = [
    (ProductCategory::Lacteos, &["leche", "yogurt", "queso", "mantequilla"]),
    (ProductCategory::Panaderia, &["pan", "hallulla", "marraqueta", "dobladitas"]),
    (ProductCategory::Carnes, &["pollo", "carne", "pescado", "cerdo"]),
    (ProductCategory::FrutasVerduras, &["manzana", "platano", "lechuga", "tomate"]),
    (ProductCategory::Abarrotes, &["arroz", "fideos", "aceite", "azucar"]),
    (ProductCategory::Limpieza, &["detergente", "shampoo", "papel"]),
    (ProductCategory::Bebidas, &["agua", "jugo", "bebida", "cerveza"]),
];

/// Classify a free-form product name; first matching keyword table wins,
/// everything unrecognized lands in [`ProductCategory::Otros`].
#[must_use]
pub fn classify_product(name: &str) -> ProductCategory {
    let lower = name.to_lowercase();
    for (category, keywords) in CATEGORY_KEYWORDS {
        if keywords.iter().any(|kw| lower.contains(kw)) {
            return category;
        }
    }
    ProductCategory::Otros
}

/// Satisfaction collapsed to five coarse buckets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum SatisfactionBucket {
    VeryHigh,
    High,
    Medium,
    Low,
    VeryLow,
}

impl SatisfactionBucket {
    pub fn from_score(score: f64) -> Self {
        if score >= 4.5 {
            SatisfactionBucket::VeryHigh
        } else if score >= 3.5 {
            SatisfactionBucket::High
        } else if score >= 2.5 {
            SatisfactionBucket::Medium
        } else if score >= 1.5 {
            SatisfactionBucket::Low
        } else {
            SatisfactionBucket::VeryLow
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SatisfactionBucket::VeryHigh => "very_high",
            SatisfactionBucket::High => "high",
            SatisfactionBucket::Medium => "medium",
            SatisfactionBucket::Low => "low",
            SatisfactionBucket::VeryLow => "very_low",
        }
    }
}

/// The anonymized tuple a cache key is derived from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheSignature {
    pub categories: Vec<ProductCategory>,
    pub decision: Decision,
    pub region: RegionCode,
    pub satisfaction: SatisfactionBucket,
}

impl CacheSignature {
    /// Reduce an interaction to its anonymized signature.  Categories are
    /// sorted so product order never changes the key; the region comes from
    /// a medium-precision location hash.
    pub fn from_interaction(interaction: &Interaction) -> Self {
        let mut categories: Vec<ProductCategory> = interaction
            .products
            .iter()
            .map(|p| classify_product(p))
            .collect();
        categories.sort();

        let region = LocationAnonymizer
            .hash(interaction.location, Precision::Medium)
            .region_code;

        Self {
            categories,
            decision: interaction.decision,
            region,
            satisfaction: SatisfactionBucket::from_score(interaction.satisfaction),
        }
    }

    /// Deterministic 16-hex-character key over the signature.
    #[must_use]
    pub fn key(&self) -> String {
        let mut hasher = Sha256::new();
        for category in &self.categories {
            hasher.update(category.as_str().as_bytes());
            hasher.update(b"|");
        }
        hasher.update(self.decision.as_str().as_bytes());
        hasher.update(b"|");
        hasher.update(self.region.as_str().as_bytes());
        hasher.update(b"|");
        hasher.update(self.satisfaction.as_str().as_bytes());
        let digest = hasher.finalize();
        let mut out = String::with_capacity(16);
        for byte in &digest[..8] {
            out.push_str(&format!("{byte:02x}"));
        }
        out
    }
}
