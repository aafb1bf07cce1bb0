//! Remote record to local entity mapping
//!
//! The marketplace is loose about types: numbers arrive as strings, fields go
//! missing or come back null. Every field is coerced to a default instead of
//! failing, so one odd record never aborts a page. Only non-object entries are
//! rejected.

use serde_json::{Map, Value};

use crate::models::{EntityRecord, OfferRecord, OperationType, OrderRecord};

const OFFER_ID_KEYS: &[&str] = &["id", "offerId", "offer_id", "external_id"];
const OFFER_SKU_KEYS: &[&str] = &["sku", "sellerSku", "seller_sku"];
const OFFER_TITLE_KEYS: &[&str] = &["title", "name"];
const OFFER_PRICE_KEYS: &[&str] = &["price"];
const OFFER_STOCK_KEYS: &[&str] = &["stock", "quantity", "availableQuantity", "available_quantity"];
const STATUS_KEYS: &[&str] = &["status"];

const ORDER_ID_KEYS: &[&str] = &["id", "orderId", "order_id", "external_id"];
const ORDER_TOTAL_KEYS: &[&str] = &["total", "totalAmount", "total_amount"];
const ORDER_CURRENCY_KEYS: &[&str] = &["currency", "currencyId", "currency_id"];
const ORDER_BUYER_KEYS: &[&str] = &["buyerName", "buyer_name"];
const ORDER_ITEM_COUNT_KEYS: &[&str] = &["itemCount", "item_count"];
const ORDER_PLACED_KEYS: &[&str] = &["createdAt", "created_at", "placedAt", "placed_at", "dateCreated"];

/// Map one raw record of `operation` into an entity owned by `account_id`
pub fn map_record(
    operation: OperationType,
    account_id: &str,
    raw: &Value,
) -> Result<EntityRecord, String> {
    let obj = raw
        .as_object()
        .ok_or_else(|| format!("expected a JSON object, got {}", type_name(raw)))?;

    Ok(match operation {
        OperationType::Offers => EntityRecord::Offer(map_offer(account_id, obj)),
        OperationType::Orders => EntityRecord::Order(map_order(account_id, obj)),
    })
}

fn map_offer(account_id: &str, obj: &Map<String, Value>) -> OfferRecord {
    OfferRecord {
        account_id: account_id.to_string(),
        external_id: coerce_string(pick(obj, OFFER_ID_KEYS)),
        sku: coerce_string(pick(obj, OFFER_SKU_KEYS)),
        title: coerce_string(pick(obj, OFFER_TITLE_KEYS)),
        price: coerce_f64(pick(obj, OFFER_PRICE_KEYS)),
        stock: coerce_i64(pick(obj, OFFER_STOCK_KEYS)),
        status: coerce_string(pick(obj, STATUS_KEYS)),
        extra: extra_fields(
            obj,
            &[
                OFFER_ID_KEYS,
                OFFER_SKU_KEYS,
                OFFER_TITLE_KEYS,
                OFFER_PRICE_KEYS,
                OFFER_STOCK_KEYS,
                STATUS_KEYS,
            ],
        ),
    }
}

fn map_order(account_id: &str, obj: &Map<String, Value>) -> OrderRecord {
    let buyer_name = match pick(obj, ORDER_BUYER_KEYS) {
        Some(v) => coerce_string(Some(v)),
        None => coerce_string(
            obj.get("buyer")
                .and_then(Value::as_object)
                .and_then(|b| pick(b, &["name", "nickname"])),
        ),
    };

    let item_count = match pick(obj, ORDER_ITEM_COUNT_KEYS) {
        Some(v) => coerce_i64(Some(v)),
        None => obj
            .get("items")
            .and_then(Value::as_array)
            .map(|items| items.len() as i64)
            .unwrap_or(0),
    };

    OrderRecord {
        account_id: account_id.to_string(),
        external_id: coerce_string(pick(obj, ORDER_ID_KEYS)),
        status: coerce_string(pick(obj, STATUS_KEYS)),
        total_amount: coerce_f64(pick(obj, ORDER_TOTAL_KEYS)),
        currency: coerce_string(pick(obj, ORDER_CURRENCY_KEYS)),
        buyer_name,
        item_count,
        placed_at: coerce_string(pick(obj, ORDER_PLACED_KEYS)),
        extra: extra_fields(
            obj,
            &[
                ORDER_ID_KEYS,
                STATUS_KEYS,
                ORDER_TOTAL_KEYS,
                ORDER_CURRENCY_KEYS,
                ORDER_BUYER_KEYS,
                ORDER_ITEM_COUNT_KEYS,
                ORDER_PLACED_KEYS,
            ],
        ),
    }
}

/// First non-null value among `keys`
fn pick<'a>(obj: &'a Map<String, Value>, keys: &[&str]) -> Option<&'a Value> {
    keys.iter()
        .filter_map(|k| obj.get(*k))
        .find(|v| !v.is_null())
}

fn extra_fields(obj: &Map<String, Value>, mapped: &[&[&str]]) -> Map<String, Value> {
    obj.iter()
        .filter(|(k, _)| !mapped.iter().any(|keys| keys.contains(&k.as_str())))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}

fn coerce_string(value: Option<&Value>) -> String {
    match value {
        None | Some(Value::Null) => String::new(),
        Some(Value::String(s)) => s.trim().to_string(),
        Some(other) => other.to_string(),
    }
}

fn coerce_f64(value: Option<&Value>) -> f64 {
    let parsed = match value {
        Some(Value::Number(n)) => n.as_f64(),
        Some(Value::String(s)) => s.trim().replace(',', ".").parse::<f64>().ok(),
        Some(Value::Bool(b)) => Some(if *b { 1.0 } else { 0.0 }),
        _ => None,
    };
    parsed.filter(|v| v.is_finite()).unwrap_or(0.0)
}

fn coerce_i64(value: Option<&Value>) -> i64 {
    match value {
        Some(Value::Number(n)) => n
            .as_i64()
            .or_else(|| n.as_f64().filter(|f| f.is_finite()).map(|f| f.trunc() as i64))
            .unwrap_or(0),
        Some(Value::String(s)) => {
            let s = s.trim();
            s.parse::<i64>()
                .ok()
                .or_else(|| s.parse::<f64>().ok().filter(|f| f.is_finite()).map(|f| f.trunc() as i64))
                .unwrap_or(0)
        }
        Some(Value::Bool(b)) => i64::from(*b),
        _ => 0,
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
