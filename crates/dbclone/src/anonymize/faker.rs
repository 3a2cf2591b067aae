//! Synthetic value generators for the FAKE mutation.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use chrono::{Duration, NaiveDate};
use rand::seq::IndexedRandom;
use rand::Rng;

use crate::core::value::SqlValue;

/// Produces one synthetic value per call.
pub type FakeGenerator = Arc<dyn Fn() -> SqlValue + Send + Sync>;

const FIRST_NAMES: &[&str] = &[
    "Ada", "Alan", "Beatrice", "Carlos", "Chen", "Dmitri", "Elena", "Farah", "Grace", "Hiro",
    "Ingrid", "Jamal", "Keiko", "Lars", "Maya", "Nadia", "Omar", "Priya", "Quinn", "Rosa",
    "Sven", "Tariq", "Uma", "Viktor", "Wen", "Yusuf", "Zoe",
];

const LAST_NAMES: &[&str] = &[
    "Anders", "Baptiste", "Costa", "Dubois", "Eriksen", "Fischer", "Garcia", "Haddad",
    "Ivanova", "Jensen", "Kowalski", "Lindqvist", "Moreau", "Nakamura", "Okafor", "Petrov",
    "Quintero", "Rossi", "Schmidt", "Tanaka", "Umarov", "Varga", "Wagner", "Yilmaz", "Zhang",
];

const CITIES: &[&str] = &[
    "Amsterdam", "Berlin", "Cairo", "Dublin", "Lisbon", "Lyon", "Montreal", "Nairobi", "Osaka",
    "Porto", "Quito", "Seoul", "Tallinn", "Utrecht", "Valencia", "Zurich",
];

const COMPANY_WORDS: &[&str] = &[
    "Acme", "Apex", "Beacon", "Cobalt", "Delta", "Ember", "Forge", "Harbor", "Juniper",
    "Keystone", "Lumen", "Meridian", "Northwind", "Orbit", "Summit", "Vertex",
];

const COMPANY_SUFFIXES: &[&str] = &["Ltd", "Inc", "GmbH", "Group", "Labs", "Systems", "Partners"];

const WORDS: &[&str] = &[
    "amber", "breeze", "canyon", "delta", "echo", "fable", "granite", "harvest", "island",
    "jasmine", "kernel", "lantern", "meadow", "nectar", "orchid", "pebble", "quartz", "river",
    "saffron", "timber", "umber", "velvet", "willow", "zephyr",
];

const EMAIL_DOMAINS: &[&str] = &["example.com", "example.org", "example.net"];

fn pick(list: &'static [&'static str]) -> &'static str {
    list.choose(&mut rand::rng()).copied().unwrap_or_default()
}

/// Category name to generator map handed to the transfer engine.
///
/// [`FakerRegistry::with_defaults`] covers the common categories; callers
/// register their own (or replace defaults with deterministic ones in tests).
#[derive(Clone, Default)]
pub struct FakerRegistry {
    generators: HashMap<String, FakeGenerator>,
}

impl FakerRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with `name`, `first_name`, `last_name`, `email`, `phone`,
    /// `city`, `company`, `word`, `uuid` and `date`.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register("first_name", || SqlValue::from(pick(FIRST_NAMES)));
        registry.register("last_name", || SqlValue::from(pick(LAST_NAMES)));
        registry.register("name", || {
            SqlValue::from(format!("{} {}", pick(FIRST_NAMES), pick(LAST_NAMES)))
        });
        registry.register("email", || {
            let n: u32 = rand::rng().random_range(1..10_000);
            SqlValue::from(format!(
                "{}.{}{}@{}",
                pick(FIRST_NAMES).to_lowercase(),
                pick(LAST_NAMES).to_lowercase(),
                n,
                pick(EMAIL_DOMAINS)
            ))
        });
        registry.register("phone", || {
            let mut rng = rand::rng();
            SqlValue::from(format!(
                "+1-{:03}-{:03}-{:04}",
                rng.random_range(200..1000),
                rng.random_range(200..1000),
                rng.random_range(0..10_000)
            ))
        });
        registry.register("city", || SqlValue::from(pick(CITIES)));
        registry.register("company", || {
            SqlValue::from(format!("{} {}", pick(COMPANY_WORDS), pick(COMPANY_SUFFIXES)))
        });
        registry.register("word", || SqlValue::from(pick(WORDS)));
        registry.register("uuid", || SqlValue::Uuid(uuid::Uuid::new_v4()));
        registry.register("date", || {
            let epoch = NaiveDate::from_ymd_opt(1970, 1, 1).unwrap_or_default();
            let days = rand::rng().random_range(0..20_000);
            SqlValue::Date(epoch + Duration::days(days))
        });
        registry
    }

    /// Add or replace the generator for `category`.
    pub fn register<F>(&mut self, category: impl Into<String>, generator: F) -> &mut Self
    where
        F: Fn() -> SqlValue + Send + Sync + 'static,
    {
        self.generators.insert(category.into(), Arc::new(generator));
        self
    }

    pub fn get(&self, category: &str) -> Option<FakeGenerator> {
        self.generators.get(category).cloned()
    }

    pub fn contains(&self, category: &str) -> bool {
        self.generators.contains_key(category)
    }

    /// Registered category names, sorted.
    pub fn categories(&self) -> Vec<String> {
        let mut names: Vec<String> = self.generators.keys().cloned().collect();
        names.sort();
        names
    }
}

impl fmt::Debug for FakerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FakerRegistry")
            .field("categories", &self.categories())
            .finish()
    }
}
