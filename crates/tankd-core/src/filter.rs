//! Query filter language shared by every list-style operation.
//!
//! Filters are JSON arrays of `[field, op, value]` ternaries, ANDed together.
//! `["OR", [alt, ...]]` groups accept either a ternary or a nested array of
//! ternaries (an AND group) per alternative. Field names are dotted paths;
//! `\.` escapes a literal dot and `*` fans out over list elements.

use crate::error::{Result, TankdError};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::cmp::Ordering;

/// Comparison performed by a ternary
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpKind {
    Eq,
    Ne,
    Gt,
    Ge,
    Lt,
    Le,
    Match,
    NotMatch,
    StartsWith,
    NotStartsWith,
    EndsWith,
    NotEndsWith,
    In,
    NotIn,
    Rin,
    Rnin,
}

impl OpKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OpKind::Eq => "=",
            OpKind::Ne => "!=",
            OpKind::Gt => ">",
            OpKind::Ge => ">=",
            OpKind::Lt => "<",
            OpKind::Le => "<=",
            OpKind::Match => "~",
            OpKind::NotMatch => "!~",
            OpKind::StartsWith => "^",
            OpKind::NotStartsWith => "!^",
            OpKind::EndsWith => "$",
            OpKind::NotEndsWith => "!$",
            OpKind::In => "in",
            OpKind::NotIn => "nin",
            OpKind::Rin => "rin",
            OpKind::Rnin => "rnin",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        let kind = match s {
            "=" => OpKind::Eq,
            "!=" => OpKind::Ne,
            ">" => OpKind::Gt,
            ">=" => OpKind::Ge,
            "<" => OpKind::Lt,
            "<=" => OpKind::Le,
            "~" => OpKind::Match,
            "!~" => OpKind::NotMatch,
            "^" => OpKind::StartsWith,
            "!^" => OpKind::NotStartsWith,
            "$" => OpKind::EndsWith,
            "!$" => OpKind::NotEndsWith,
            "in" => OpKind::In,
            "nin" => OpKind::NotIn,
            "rin" => OpKind::Rin,
            "rnin" => OpKind::Rnin,
            _ => return None,
        };
        Some(kind)
    }
}

/// Operator with its optional case-folding `C` prefix
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Operator {
    pub kind: OpKind,
    pub case_insensitive: bool,
}

impl Operator {
    pub fn parse(s: &str) -> Option<Self> {
        if let Some(kind) = OpKind::parse(s) {
            return Some(Self {
                kind,
                case_insensitive: false,
            });
        }
        let kind = OpKind::parse(s.strip_prefix('C')?)?;
        Some(Self {
            kind,
            case_insensitive: true,
        })
    }
}

/// A single `[field, op, value]` comparison
#[derive(Debug, Clone)]
pub struct Ternary {
    pub field: String,
    pub op: Operator,
    pub value: Value,
    regex: Option<Regex>,
}

impl Ternary {
    pub fn new(field: impl Into<String>, op: Operator, value: Value) -> Result<Self> {
        let field = field.into();
        let regex = match op.kind {
            OpKind::Match | OpKind::NotMatch => {
                let pattern = value.as_str().ok_or_else(|| {
                    TankdError::validation("filters", format!("{}: regex must be a string", field))
                })?;
                let flags = if op.case_insensitive { "(?i)" } else { "" };
                let re = Regex::new(&format!("{}^(?:{})", flags, pattern)).map_err(|e| {
                    TankdError::validation("filters", format!("{}: invalid regex: {}", field, e))
                })?;
                Some(re)
            }
            _ => None,
        };
        Ok(Self {
            field,
            op,
            value,
            regex,
        })
    }

    fn matches(&self, item: &Value) -> bool {
        let candidates = lookup(item, &self.field);
        candidates.iter().any(|x| self.compare(x))
    }

    fn compare(&self, x: &Value) -> bool {
        let ci = self.op.case_insensitive;
        let v = &self.value;
        match self.op.kind {
            OpKind::Eq => values_equal(x, v, ci),
            OpKind::Ne => !values_equal(x, v, ci),
            OpKind::Gt => order_of(x, v, ci) == Some(Ordering::Greater),
            OpKind::Ge => matches!(
                order_of(x, v, ci),
                Some(Ordering::Greater) | Some(Ordering::Equal)
            ),
            OpKind::Lt => order_of(x, v, ci) == Some(Ordering::Less),
            OpKind::Le => matches!(
                order_of(x, v, ci),
                Some(Ordering::Less) | Some(Ordering::Equal)
            ),
            OpKind::Match => match (x.as_str(), &self.regex) {
                (Some(s), Some(re)) => re.is_match(s),
                _ => false,
            },
            OpKind::NotMatch => match (x.as_str(), &self.regex) {
                (Some(s), Some(re)) => !re.is_match(s),
                _ => false,
            },
            OpKind::StartsWith => str_pair(x, v, ci).is_some_and(|(a, b)| a.starts_with(&b)),
            OpKind::NotStartsWith => str_pair(x, v, ci).is_some_and(|(a, b)| !a.starts_with(&b)),
            OpKind::EndsWith => str_pair(x, v, ci).is_some_and(|(a, b)| a.ends_with(&b)),
            OpKind::NotEndsWith => str_pair(x, v, ci).is_some_and(|(a, b)| !a.ends_with(&b)),
            OpKind::In => contains(v, x, ci).unwrap_or(false),
            OpKind::NotIn => contains(v, x, ci).map(|c| !c).unwrap_or(false),
            OpKind::Rin => contains(x, v, ci).unwrap_or(false),
            OpKind::Rnin => contains(x, v, ci).map(|c| !c).unwrap_or(false),
        }
    }
}

/// Parsed filter item
#[derive(Debug, Clone)]
pub enum Filter {
    Ternary(Ternary),
    /// Alternatives; each alternative is an AND group
    Or(Vec<Vec<Filter>>),
}

impl Filter {
    /// Convenience constructor for programmatic filters
    pub fn ternary(field: &str, op: &str, value: Value) -> Result<Self> {
        let operator = Operator::parse(op)
            .ok_or_else(|| TankdError::validation("filters", format!("Invalid operator: {}", op)))?;
        Ok(Filter::Ternary(Ternary::new(field, operator, value)?))
    }

    /// Parse a JSON filter list
    pub fn parse_list(filters: &Value) -> Result<Vec<Filter>> {
        match filters {
            Value::Null => Ok(Vec::new()),
            Value::Array(items) => items.iter().map(Filter::parse).collect(),
            other => Err(TankdError::validation(
                "filters",
                format!("Filters must be a list, got {}", other),
            )),
        }
    }

    fn parse(item: &Value) -> Result<Filter> {
        let arr = item.as_array().ok_or_else(|| {
            TankdError::validation("filters", format!("Filter must be a list: {}", item))
        })?;

        if arr.len() == 2 && arr[0].as_str() == Some("OR") {
            let alternatives = arr[1].as_array().ok_or_else(|| {
                TankdError::validation("filters", "OR filter expects a list of alternatives")
            })?;
            if alternatives.is_empty() {
                return Err(TankdError::validation(
                    "filters",
                    "OR filter requires at least one alternative",
                ));
            }
            let mut groups = Vec::with_capacity(alternatives.len());
            for alt in alternatives {
                let is_group = alt
                    .as_array()
                    .and_then(|a| a.first())
                    .is_some_and(|first| first.is_array());
                if is_group {
                    groups.push(Filter::parse_list(alt)?);
                } else {
                    groups.push(vec![Filter::parse(alt)?]);
                }
            }
            return Ok(Filter::Or(groups));
        }

        if arr.len() == 3 {
            if let (Some(field), Some(op)) = (arr[0].as_str(), arr[1].as_str()) {
                return Filter::ternary(field, op, arr[2].clone());
            }
        }

        Err(TankdError::validation(
            "filters",
            format!("Invalid filter {}", item),
        ))
    }

    pub fn matches(&self, item: &Value) -> bool {
        match self {
            Filter::Ternary(t) => t.matches(item),
            Filter::Or(groups) => groups.iter().any(|g| matches_all(item, g)),
        }
    }

    pub fn as_ternary(&self) -> Option<&Ternary> {
        match self {
            Filter::Ternary(t) => Some(t),
            Filter::Or(_) => None,
        }
    }
}

/// True when `item` satisfies every filter
pub fn matches_all(item: &Value, filters: &[Filter]) -> bool {
    filters.iter().all(|f| f.matches(item))
}

/// Options accepted by every query operation
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct QueryOptions {
    pub get: bool,
    pub count: bool,
    /// 0 means unlimited
    pub limit: i64,
    pub offset: i64,
    pub order_by: Vec<String>,
    pub select: Vec<Value>,
    pub force_sql_filters: bool,
    pub extra: Map<String, Value>,
}

impl QueryOptions {
    pub fn get() -> Self {
        Self {
            get: true,
            ..Default::default()
        }
    }

    pub fn with_extra(mut self, key: &str, value: Value) -> Self {
        self.extra.insert(key.to_string(), value);
        self
    }

    /// Boolean extra with a default
    pub fn extra_bool(&self, key: &str, default: bool) -> bool {
        self.extra
            .get(key)
            .and_then(|v| v.as_bool())
            .unwrap_or(default)
    }

    pub fn validate(&self) -> Result<()> {
        let mut verrors = crate::error::ValidationErrors::new();
        if self.get && self.count {
            verrors.add(
                "query-options.get",
                "Cannot be used together with \"count\"",
            );
        }
        if self.limit < 0 {
            verrors.add("query-options.limit", "Must be a non-negative integer");
        }
        if self.offset < 0 {
            verrors.add("query-options.offset", "Must be a non-negative integer");
        }
        for (i, order) in self.order_by.iter().enumerate() {
            if OrderKey::parse(order).field.is_empty() {
                verrors.add(
                    format!("query-options.order_by.{}", i),
                    "Field name must not be empty",
                );
            }
        }
        for (i, sel) in self.select.iter().enumerate() {
            if let Err(msg) = SelectItem::parse(sel) {
                verrors.add(format!("query-options.select.{}", i), msg);
            }
        }
        verrors.check()
    }

    /// Apply count, ordering, pagination, selection and `get` to items
    /// that already passed the filters
    pub fn finish(&self, mut items: Vec<Value>) -> Result<QueryResult> {
        if self.count {
            return Ok(QueryResult::Count(items.len()));
        }

        if !self.order_by.is_empty() {
            sort_by_keys(&mut items, &self.order_by);
        }

        let offset = self.offset.max(0) as usize;
        if offset > 0 {
            items = items.into_iter().skip(offset).collect();
        }
        if self.limit > 0 {
            items.truncate(self.limit as usize);
        }

        if !self.select.is_empty() {
            let selects: Vec<SelectItem> = self
                .select
                .iter()
                .map(SelectItem::parse)
                .collect::<std::result::Result<_, _>>()
                .map_err(|msg| TankdError::validation("query-options.select", msg))?;
            items = items.iter().map(|i| apply_select(i, &selects)).collect();
        }

        if self.get {
            return items
                .into_iter()
                .next()
                .map(QueryResult::Single)
                .ok_or_else(|| TankdError::not_found("Object not found"));
        }

        Ok(QueryResult::List(items))
    }
}

/// Shape of a query answer
#[derive(Debug, Clone, PartialEq)]
pub enum QueryResult {
    List(Vec<Value>),
    Single(Value),
    Count(usize),
}

impl QueryResult {
    pub fn into_value(self) -> Value {
        match self {
            QueryResult::List(items) => Value::Array(items),
            QueryResult::Single(item) => item,
            QueryResult::Count(n) => Value::from(n),
        }
    }

    /// List items; a single result becomes a one-element list
    pub fn into_list(self) -> Vec<Value> {
        match self {
            QueryResult::List(items) => items,
            QueryResult::Single(item) => vec![item],
            QueryResult::Count(_) => Vec::new(),
        }
    }

    pub fn into_single(self) -> Option<Value> {
        match self {
            QueryResult::Single(item) => Some(item),
            QueryResult::List(items) => items.into_iter().next(),
            QueryResult::Count(_) => None,
        }
    }
}

/// Filter, then count/order/paginate/select/get
pub fn filter_list(
    items: Vec<Value>,
    filters: &[Filter],
    options: &QueryOptions,
) -> Result<QueryResult> {
    options.validate()?;
    let matched: Vec<Value> = items
        .into_iter()
        .filter(|i| matches_all(i, filters))
        .collect();
    options.finish(matched)
}

static NULL: Value = Value::Null;

struct OrderKey {
    field: String,
    descending: bool,
    nulls_first: bool,
}

impl OrderKey {
    fn parse(raw: &str) -> Self {
        let (nulls_first, rest) = if let Some(r) = raw.strip_prefix("nulls_first:") {
            (true, r)
        } else if let Some(r) = raw.strip_prefix("nulls_last:") {
            (false, r)
        } else {
            (false, raw)
        };
        let (descending, field) = match rest.strip_prefix('-') {
            Some(f) => (true, f),
            None => (false, rest),
        };
        Self {
            field: field.to_string(),
            descending,
            nulls_first,
        }
    }
}

fn sort_by_keys(items: &mut [Value], order_by: &[String]) {
    let keys: Vec<OrderKey> = order_by.iter().map(|o| OrderKey::parse(o)).collect();
    items.sort_by(|a, b| {
        for key in &keys {
            let av = lookup(a, &key.field).into_iter().next().unwrap_or(&NULL);
            let bv = lookup(b, &key.field).into_iter().next().unwrap_or(&NULL);
            let ord = match (av.is_null(), bv.is_null()) {
                (true, true) => Ordering::Equal,
                (true, false) if key.nulls_first => Ordering::Less,
                (true, false) => Ordering::Greater,
                (false, true) if key.nulls_first => Ordering::Greater,
                (false, true) => Ordering::Less,
                (false, false) => {
                    let ord = total_order(av, bv);
                    if key.descending {
                        ord.reverse()
                    } else {
                        ord
                    }
                }
            };
            if ord != Ordering::Equal {
                return ord;
            }
        }
        Ordering::Equal
    });
}

struct SelectItem {
    path: Vec<String>,
    alias: Option<String>,
}

impl SelectItem {
    fn parse(raw: &Value) -> std::result::Result<Self, String> {
        match raw {
            Value::String(s) => Ok(Self {
                path: split_path(s),
                alias: None,
            }),
            Value::Array(pair) => {
                if pair.len() != 2 {
                    return Err(format!(
                        "{}: select as list may only contain two parameters",
                        raw
                    ));
                }
                match (pair[0].as_str(), pair[1].as_str()) {
                    (Some(field), Some(alias)) => Ok(Self {
                        path: split_path(field),
                        alias: Some(alias.to_string()),
                    }),
                    _ => Err(format!("{}: select as list must contain strings", raw)),
                }
            }
            other => Err(format!("{}: selector must be a string or a list", other)),
        }
    }
}

fn apply_select(item: &Value, selects: &[SelectItem]) -> Value {
    let mut out = Map::new();
    for sel in selects {
        let Some(found) = lookup_path(item, &sel.path) else {
            continue;
        };
        match &sel.alias {
            Some(alias) => {
                out.insert(alias.clone(), found.clone());
            }
            None => insert_nested(&mut out, &sel.path, found.clone()),
        }
    }
    Value::Object(out)
}

fn insert_nested(out: &mut Map<String, Value>, path: &[String], value: Value) {
    match path {
        [] => {}
        [last] => {
            out.insert(last.clone(), value);
        }
        [head, rest @ ..] => {
            let entry = out
                .entry(head.clone())
                .or_insert_with(|| Value::Object(Map::new()));
            if !entry.is_object() {
                *entry = Value::Object(Map::new());
            }
            if let Value::Object(inner) = entry {
                insert_nested(inner, rest, value);
            }
        }
    }
}

/// Split a dotted field name, honouring `\.` escapes
pub fn split_path(field: &str) -> Vec<String> {
    let mut parts = Vec::new();
    let mut current = String::new();
    let mut chars = field.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '\\' if chars.peek() == Some(&'.') => {
                current.push('.');
                chars.next();
            }
            '.' => parts.push(std::mem::take(&mut current)),
            _ => current.push(c),
        }
    }
    parts.push(current);
    parts
}

/// All values addressed by `field`; empty when the field is absent
pub fn lookup<'a>(item: &'a Value, field: &str) -> Vec<&'a Value> {
    let path = split_path(field);
    let mut current = vec![item];
    for part in &path {
        let mut next = Vec::new();
        for v in current {
            if part == "*" {
                if let Value::Array(items) = v {
                    next.extend(items.iter());
                }
            } else if let Value::Object(map) = v {
                if let Some(child) = map.get(part) {
                    next.push(child);
                }
            }
        }
        current = next;
    }
    current
}

fn lookup_path<'a>(item: &'a Value, path: &[String]) -> Option<&'a Value> {
    let mut current = item;
    for part in path {
        current = current.as_object()?.get(part)?;
    }
    Some(current)
}

fn fold(s: &str, ci: bool) -> String {
    if ci {
        s.to_lowercase()
    } else {
        s.to_string()
    }
}

fn str_pair(x: &Value, v: &Value, ci: bool) -> Option<(String, String)> {
    Some((fold(x.as_str()?, ci), fold(v.as_str()?, ci)))
}

fn values_equal(a: &Value, b: &Value, ci: bool) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => match (x.as_f64(), y.as_f64()) {
            (Some(x), Some(y)) => x == y,
            _ => x == y,
        },
        (Value::String(x), Value::String(y)) if ci => x.to_lowercase() == y.to_lowercase(),
        _ => a == b,
    }
}

fn order_of(a: &Value, b: &Value, ci: bool) -> Option<Ordering> {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64()?.partial_cmp(&y.as_f64()?),
        (Value::String(x), Value::String(y)) => Some(fold(x, ci).cmp(&fold(y, ci))),
        (Value::Bool(x), Value::Bool(y)) => Some(x.cmp(y)),
        _ => None,
    }
}

/// `needle in haystack`; `None` when the haystack cannot contain anything
fn contains(haystack: &Value, needle: &Value, ci: bool) -> Option<bool> {
    match haystack {
        Value::Array(items) => Some(items.iter().any(|i| values_equal(i, needle, ci))),
        Value::String(s) => needle.as_str().map(|n| fold(s, ci).contains(&fold(n, ci))),
        Value::Object(map) => needle.as_str().map(|n| map.contains_key(n)),
        _ => None,
    }
}

fn type_rank(v: &Value) -> u8 {
    match v {
        Value::Null => 0,
        Value::Bool(_) => 1,
        Value::Number(_) => 2,
        Value::String(_) => 3,
        Value::Array(_) => 4,
        Value::Object(_) => 5,
    }
}

fn total_order(a: &Value, b: &Value) -> Ordering {
    order_of(a, b, false).unwrap_or_else(|| type_rank(a).cmp(&type_rank(b)))
}
