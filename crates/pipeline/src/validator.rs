//! Schema registry and structural checks for canonical events.
//!
//! Validation is advisory by design: it runs only in debug mode, and a
//! failing event is still delivered. Missing schemas produce a warning
//! rather than an error so new event names can ship ahead of their schema.

use common::types::{self, CanonicalEvent};
use rust_decimal::Decimal;
use serde_json::Value;
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldType {
    String,
    Number,
    Boolean,
    Object,
    Array,
}

impl FieldType {
    fn matches(self, value: &Value) -> bool {
        match self {
            Self::String => value.is_string(),
            // Monetary decimals serialize as strings to avoid float loss,
            // so Number accepts a JSON number or a decimal-parseable string.
            Self::Number => {
                value.is_number()
                    || value
                        .as_str()
                        .is_some_and(|s| s.parse::<Decimal>().is_ok())
            }
            Self::Boolean => value.is_boolean(),
            Self::Object => value.is_object(),
            Self::Array => value.is_array(),
        }
    }

    fn label(self) -> &'static str {
        match self {
            Self::String => "string",
            Self::Number => "number",
            Self::Boolean => "boolean",
            Self::Object => "object",
            Self::Array => "array",
        }
    }
}

/// One dotted-path rule, e.g. `ecommerce.currency` or `properties.path`.
#[derive(Debug, Clone)]
pub struct FieldRule {
    pub path: String,
    pub field_type: FieldType,
    pub required: bool,
}

impl FieldRule {
    pub fn required(path: &str, field_type: FieldType) -> Self {
        Self {
            path: path.to_string(),
            field_type,
            required: true,
        }
    }

    pub fn optional(path: &str, field_type: FieldType) -> Self {
        Self {
            path: path.to_string(),
            field_type,
            required: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct EventSchema {
    pub name: String,
    pub version: String,
    pub fields: Vec<FieldRule>,
    /// Rules applied to each element of `ecommerce.items`.
    pub item_fields: Vec<FieldRule>,
}

#[derive(Debug, Clone, Default)]
pub struct ValidationReport {
    pub valid: bool,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

pub struct Validator {
    schemas: HashMap<String, EventSchema>,
}

impl Validator {
    pub fn new() -> Self {
        Self {
            schemas: HashMap::new(),
        }
    }

    pub fn with_default_schemas(schema_version: &str) -> Self {
        let mut validator = Self::new();
        for schema in default_schemas(schema_version) {
            validator.register(schema);
        }
        validator
    }

    pub fn register(&mut self, schema: EventSchema) {
        self.schemas.insert(schema.name.clone(), schema);
    }

    pub fn has_schema(&self, name: &str) -> bool {
        self.schemas.contains_key(name)
    }

    pub fn validate(&self, event: &CanonicalEvent) -> ValidationReport {
        let mut report = ValidationReport {
            valid: true,
            errors: Vec::new(),
            warnings: Vec::new(),
        };

        let value = match serde_json::to_value(event) {
            Ok(v) => v,
            Err(e) => {
                report.valid = false;
                report.errors.push(format!("event not serializable: {e}"));
                return report;
            }
        };

        match self.schemas.get(&event.name) {
            Some(schema) => {
                for rule in &schema.fields {
                    check_rule(&value, rule, &mut report);
                }
                if let Some(items) = value.pointer("/ecommerce/items").and_then(Value::as_array) {
                    for (idx, item) in items.iter().enumerate() {
                        for rule in &schema.item_fields {
                            check_item_rule(item, idx, rule, &mut report);
                        }
                    }
                }
            }
            None => {
                report
                    .warnings
                    .push(format!("no schema registered for event '{}'", event.name));
            }
        }

        semantic_checks(event, &mut report);

        report.valid = report.errors.is_empty();
        report
    }
}

impl Default for Validator {
    fn default() -> Self {
        Self::new()
    }
}

fn lookup<'a>(root: &'a Value, dotted: &str) -> Option<&'a Value> {
    let mut current = root;
    for segment in dotted.split('.') {
        current = current.get(segment)?;
    }
    Some(current)
}

fn check_rule(root: &Value, rule: &FieldRule, report: &mut ValidationReport) {
    match lookup(root, &rule.path) {
        Some(value) => {
            if !rule.field_type.matches(value) {
                report.errors.push(format!(
                    "field '{}' has wrong type (expected {})",
                    rule.path,
                    rule.field_type.label()
                ));
            }
        }
        None if rule.required => {
            report
                .errors
                .push(format!("missing required field '{}'", rule.path));
        }
        None => {}
    }
}

fn check_item_rule(item: &Value, idx: usize, rule: &FieldRule, report: &mut ValidationReport) {
    match lookup(item, &rule.path) {
        Some(value) => {
            if !rule.field_type.matches(value) {
                report.errors.push(format!(
                    "items[{idx}].{} has wrong type (expected {})",
                    rule.path,
                    rule.field_type.label()
                ));
            }
        }
        None if rule.required => {
            report
                .errors
                .push(format!("items[{idx}] missing required field '{}'", rule.path));
        }
        None => {}
    }
}

/// Commerce rules layered over the structural checks. These hold for every
/// event regardless of whether a schema is registered for it.
fn semantic_checks(event: &CanonicalEvent, report: &mut ValidationReport) {
    let Some(ecommerce) = &event.ecommerce else {
        if event.name == types::PURCHASE {
            report
                .errors
                .push("purchase event is missing its ecommerce block".to_string());
        }
        return;
    };

    let currency_ok =
        ecommerce.currency.len() == 3 && ecommerce.currency.chars().all(|c| c.is_ascii_uppercase());
    if !currency_ok {
        report.errors.push(format!(
            "currency '{}' is not a 3-letter uppercase code",
            ecommerce.currency
        ));
    }

    if ecommerce.value < Decimal::ZERO {
        report
            .errors
            .push(format!("monetary value {} is negative", ecommerce.value));
    }
    for (label, amount) in [("tax", ecommerce.tax), ("shipping", ecommerce.shipping)] {
        if let Some(amount) = amount {
            if amount < Decimal::ZERO {
                report.errors.push(format!("{label} {amount} is negative"));
            }
        }
    }

    if event.name == types::PURCHASE
        && ecommerce
            .transaction_id
            .as_deref()
            .is_none_or(str::is_empty)
    {
        report
            .errors
            .push("purchase event requires a transaction id".to_string());
    }

    for (idx, item) in ecommerce.items.iter().enumerate() {
        if item.item_id.is_empty() {
            report.errors.push(format!("items[{idx}] has no identity"));
        }
        if item.item_name.is_empty() {
            report.errors.push(format!("items[{idx}] has no name"));
        }
        if item.price < Decimal::ZERO {
            report
                .errors
                .push(format!("items[{idx}] price {} is negative", item.price));
        }
    }
}

fn commerce_schema(name: &str, version: &str) -> EventSchema {
    EventSchema {
        name: name.to_string(),
        version: version.to_string(),
        fields: vec![
            FieldRule::required("name", FieldType::String),
            FieldRule::required("id", FieldType::String),
            FieldRule::required("properties", FieldType::Object),
            FieldRule::required("ecommerce", FieldType::Object),
            FieldRule::required("ecommerce.currency", FieldType::String),
            FieldRule::required("ecommerce.value", FieldType::Number),
            FieldRule::required("ecommerce.items", FieldType::Array),
        ],
        item_fields: vec![
            FieldRule::required("item_id", FieldType::String),
            FieldRule::required("item_name", FieldType::String),
            FieldRule::required("price", FieldType::Number),
            FieldRule::required("quantity", FieldType::Number),
            FieldRule::optional("item_list_name", FieldType::String),
            FieldRule::optional("index", FieldType::Number),
        ],
    }
}

fn bare_schema(name: &str, version: &str) -> EventSchema {
    EventSchema {
        name: name.to_string(),
        version: version.to_string(),
        fields: vec![
            FieldRule::required("name", FieldType::String),
            FieldRule::required("id", FieldType::String),
            FieldRule::required("properties", FieldType::Object),
        ],
        item_fields: Vec::new(),
    }
}

/// The built-in schema set covering every canonical commerce event name.
pub fn default_schemas(version: &str) -> Vec<EventSchema> {
    let mut purchase = commerce_schema(types::PURCHASE, version);
    purchase
        .fields
        .push(FieldRule::required("ecommerce.transaction_id", FieldType::String));
    purchase
        .fields
        .push(FieldRule::optional("ecommerce.tax", FieldType::Number));
    purchase
        .fields
        .push(FieldRule::optional("ecommerce.shipping", FieldType::Number));

    let mut page_view = bare_schema(types::PAGE_VIEW, version);
    page_view
        .fields
        .push(FieldRule::required("properties.path", FieldType::String));

    vec![
        page_view,
        commerce_schema(types::VIEW_ITEM, version),
        commerce_schema(types::ADD_TO_CART, version),
        commerce_schema(types::REMOVE_FROM_CART, version),
        commerce_schema(types::PACKAGE_SWAP, version),
        purchase,
        commerce_schema(types::UPSELL_VIEW, version),
        commerce_schema(types::UPSELL_ACCEPT, version),
        bare_schema(types::UPSELL_SKIP, version),
        bare_schema(types::USER_DATA, version),
    ]
}
