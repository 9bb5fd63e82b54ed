//! In-memory engine for tests
//!
//! [`FakeCluster`] understands the statements this crate generates: database
//! switching, `show` statements, Kudu `CREATE TABLE`, range partition
//! maintenance, multi-row `insert`/`upsert` and simple `select`s. Range
//! partitions are enforced the way Kudu does it: overlapping ranges are
//! rejected and rows outside every range become row errors.
//!
//! Failures can be injected per statement fragment. A transport failure
//! breaks the connection that saw it; every later call on that connection
//! fails the same way.

use async_trait::async_trait;
use parking_lot::Mutex;
use regex::Regex;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use uuid::Uuid;

use impala_common::{
    FetchResult, FieldSchema, HostAddr, ImpalaError, ImpalaResult, ImpalaService, InsertResult,
    PartitionSet, QueryHandle, RangePartition, ResultsMetadata, ServiceConnector,
};

const DEFAULT_ROWS_PER_FETCH: usize = 1024;
const DEFAULT_DELIMITER: &str = "\t";
const NULL_CELL: &str = "NULL";

#[derive(Debug, Clone)]
struct FakeTable {
    definition: String,
    columns: Vec<String>,
    primary_key: Vec<usize>,
    range_column: Option<usize>,
    partitions: PartitionSet,
    rows: Vec<Vec<String>>,
}

impl FakeTable {
    fn column_index(&self, name: &str) -> Option<usize> {
        self.columns
            .iter()
            .position(|c| c.eq_ignore_ascii_case(name))
    }

    fn key_of(&self, row: &[String]) -> Vec<String> {
        self.primary_key.iter().map(|i| row[*i].clone()).collect()
    }
}

#[derive(Debug, Clone, Default)]
struct Outcome {
    columns: Vec<String>,
    rows: Vec<String>,
    insert: Option<InsertResult>,
    log: String,
}

impl Outcome {
    fn rows(columns: Vec<String>, rows: Vec<String>) -> Self {
        Self {
            columns,
            rows,
            ..Self::default()
        }
    }
}

struct Failure {
    fragment: String,
    error: ImpalaError,
}

struct Script {
    prefix: String,
    columns: Vec<String>,
    rows: Vec<String>,
}

struct ClusterState {
    databases: Vec<String>,
    tables: BTreeMap<String, FakeTable>,
    refuse_connections: bool,
    connect_attempts: usize,
    failures: Vec<Failure>,
    scripts: Vec<Script>,
    pending_fetches: usize,
    rows_per_fetch: usize,
    insert_row_errors: i64,
    log_failure: Option<ImpalaError>,
    delimiter: String,
    statements: Vec<String>,
    open_handles: usize,
}

impl Default for ClusterState {
    fn default() -> Self {
        Self {
            databases: vec!["default".to_string()],
            tables: BTreeMap::new(),
            refuse_connections: false,
            connect_attempts: 0,
            failures: Vec::new(),
            scripts: Vec::new(),
            pending_fetches: 0,
            rows_per_fetch: DEFAULT_ROWS_PER_FETCH,
            insert_row_errors: 0,
            log_failure: None,
            delimiter: DEFAULT_DELIMITER.to_string(),
            statements: Vec::new(),
            open_handles: 0,
        }
    }
}

/// Shared in-memory engine; clones see the same state
#[derive(Clone, Default)]
pub struct FakeCluster {
    state: Arc<Mutex<ClusterState>>,
}

impl FakeCluster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a connection, as a connector would
    pub fn open(&self, host: &HostAddr) -> ImpalaResult<Box<dyn ImpalaService>> {
        let mut state = self.state.lock();
        state.connect_attempts += 1;
        if state.refuse_connections {
            return Err(ImpalaError::Transport(format!(
                "connection to {} refused",
                host
            )));
        }
        Ok(Box::new(FakeService {
            cluster: self.clone(),
            database: "default".to_string(),
            broken: false,
            executions: HashMap::new(),
        }))
    }

    pub fn refuse_connections(&self, refuse: bool) {
        self.state.lock().refuse_connections = refuse;
    }

    pub fn connect_attempts(&self) -> usize {
        self.state.lock().connect_attempts
    }

    /// Number of not-ready fetches before each statement's rows appear
    pub fn set_pending_fetches(&self, fetches: usize) {
        self.state.lock().pending_fetches = fetches;
    }

    pub fn set_rows_per_fetch(&self, rows: usize) {
        self.state.lock().rows_per_fetch = rows.max(1);
    }

    /// Answer statements starting with `prefix` with fixed rows
    pub fn script_result(&self, prefix: &str, columns: &[&str], rows: &[&str]) {
        self.state.lock().scripts.push(Script {
            prefix: prefix.trim().to_lowercase(),
            columns: columns.iter().map(|c| c.to_string()).collect(),
            rows: rows.iter().map(|r| r.to_string()).collect(),
        });
    }

    /// Fail every statement containing `fragment` (case-insensitive)
    pub fn fail_statements_matching(&self, fragment: &str, error: ImpalaError) {
        self.state.lock().failures.push(Failure {
            fragment: fragment.to_lowercase(),
            error,
        });
    }

    pub fn clear_failures(&self) {
        self.state.lock().failures.clear();
    }

    /// Extra row errors reported by every insert
    pub fn set_insert_row_errors(&self, errors: i64) {
        self.state.lock().insert_row_errors = errors;
    }

    /// Fail every `get_log` call with `error`, or stop failing with `None`
    pub fn fail_log_fetch(&self, error: Option<ImpalaError>) {
        self.state.lock().log_failure = error;
    }

    /// Cell delimiter reported in results metadata
    pub fn set_delimiter(&self, delimiter: &str) {
        self.state.lock().delimiter = delimiter.to_string();
    }

    pub fn create_database(&self, name: &str) {
        let mut state = self.state.lock();
        if !state.databases.iter().any(|d| d.eq_ignore_ascii_case(name)) {
            state.databases.push(name.to_string());
        }
    }

    /// Every statement received, in order
    pub fn statements(&self) -> Vec<String> {
        self.state.lock().statements.clone()
    }

    pub fn statements_matching(&self, fragment: &str) -> Vec<String> {
        let fragment = fragment.to_lowercase();
        self.state
            .lock()
            .statements
            .iter()
            .filter(|s| s.to_lowercase().contains(&fragment))
            .cloned()
            .collect()
    }

    /// Statements whose text starts with `prefix` (case-insensitive)
    pub fn statements_starting_with(&self, prefix: &str) -> Vec<String> {
        let prefix = prefix.to_lowercase();
        self.state
            .lock()
            .statements
            .iter()
            .filter(|s| s.trim_start().to_lowercase().starts_with(&prefix))
            .cloned()
            .collect()
    }

    /// Handles opened and not yet closed
    pub fn open_handles(&self) -> usize {
        self.state.lock().open_handles
    }

    pub fn has_table(&self, qualified: &str) -> bool {
        self.state
            .lock()
            .tables
            .contains_key(&qualified.to_lowercase())
    }

    pub fn range_partitions(&self, qualified: &str) -> Vec<RangePartition> {
        self.state
            .lock()
            .tables
            .get(&qualified.to_lowercase())
            .map(|t| t.partitions.ranges().to_vec())
            .unwrap_or_default()
    }

    pub fn rows(&self, qualified: &str) -> Vec<Vec<String>> {
        self.state
            .lock()
            .tables
            .get(&qualified.to_lowercase())
            .map(|t| t.rows.clone())
            .unwrap_or_default()
    }

    pub fn row_count(&self, qualified: &str) -> usize {
        self.rows(qualified).len()
    }

    fn execute(&self, database: &mut String, statement: &str) -> ImpalaResult<Execution> {
        let mut state = self.state.lock();
        state.statements.push(statement.to_string());

        let lowered = statement.to_lowercase();
        if let Some(failure) = state
            .failures
            .iter()
            .find(|f| lowered.contains(&f.fragment))
        {
            return Err(failure.error.clone());
        }

        let scripted = state
            .scripts
            .iter()
            .find(|s| lowered.trim_start().starts_with(&s.prefix))
            .map(|s| Outcome::rows(s.columns.clone(), s.rows.clone()));
        let outcome = match scripted {
            Some(outcome) => outcome,
            None => state.run(database, statement)?,
        };

        state.open_handles += 1;
        Ok(Execution {
            outcome,
            pending: state.pending_fetches,
            cursor: 0,
        })
    }

    fn rows_per_fetch(&self) -> usize {
        self.state.lock().rows_per_fetch
    }

    fn delimiter(&self) -> String {
        self.state.lock().delimiter.clone()
    }

    fn log_failure(&self) -> Option<ImpalaError> {
        self.state.lock().log_failure.clone()
    }

    fn handle_closed(&self) {
        let mut state = self.state.lock();
        state.open_handles = state.open_handles.saturating_sub(1);
    }
}

fn pattern(source: &str) -> ImpalaResult<Regex> {
    Regex::new(source).map_err(|e| ImpalaError::Server(format!("bad pattern: {}", e)))
}

fn analysis_error(message: impl AsRef<str>) -> ImpalaError {
    ImpalaError::Server(format!("AnalysisException: {}", message.as_ref()))
}

impl ClusterState {
    fn run(&mut self, database: &mut String, statement: &str) -> ImpalaResult<Outcome> {
        let text = statement.trim();
        let lowered = text.to_lowercase();

        if lowered.starts_with("show databases") {
            return Ok(Outcome::rows(vec!["name".into()], self.databases.clone()));
        }
        if lowered.starts_with("show tables") {
            let prefix = format!("{}.", database.to_lowercase());
            let tables = self
                .tables
                .keys()
                .filter_map(|k| k.strip_prefix(&prefix))
                .map(str::to_string)
                .collect();
            return Ok(Outcome::rows(vec!["name".into()], tables));
        }
        if lowered.starts_with("use ") {
            return self.use_database(database, text);
        }
        if lowered.starts_with("show create table") {
            let name = trailing_name(text, "show create table")?;
            let table = self.table(database, &name)?;
            return Ok(Outcome::rows(
                vec!["result".into()],
                vec![table.definition.clone()],
            ));
        }
        if lowered.starts_with("show range partitions") {
            let name = trailing_name(text, "show range partitions")?;
            return self.show_range_partitions(database, &name);
        }
        if lowered.starts_with("create table") {
            return self.create_table(database, text);
        }
        if lowered.starts_with("alter table") {
            return self.alter_table(database, text);
        }
        if lowered.starts_with("insert") || lowered.starts_with("upsert") {
            return self.insert(database, text);
        }
        if lowered.starts_with("select") {
            return self.select(database, text);
        }
        Err(analysis_error(format!("Syntax error in line 1: {}", text)))
    }

    fn qualify(database: &str, name: &str) -> String {
        if name.contains('.') {
            name.to_lowercase()
        } else {
            format!("{}.{}", database, name).to_lowercase()
        }
    }

    fn table(&self, database: &str, name: &str) -> ImpalaResult<&FakeTable> {
        self.tables
            .get(&Self::qualify(database, name))
            .ok_or_else(|| analysis_error(format!("Table does not exist: {}", name)))
    }

    fn table_mut(&mut self, database: &str, name: &str) -> ImpalaResult<&mut FakeTable> {
        self.tables
            .get_mut(&Self::qualify(database, name))
            .ok_or_else(|| analysis_error(format!("Table does not exist: {}", name)))
    }

    fn use_database(&mut self, database: &mut String, text: &str) -> ImpalaResult<Outcome> {
        let name = trailing_name(text, "use")?;
        if !self.databases.iter().any(|d| d.eq_ignore_ascii_case(&name)) {
            return Err(analysis_error(format!("Database does not exist: {}", name)));
        }
        *database = name;
        Ok(Outcome::default())
    }

    fn show_range_partitions(&self, database: &str, name: &str) -> ImpalaResult<Outcome> {
        let table = self.table(database, name)?;
        let Some(column) = table.range_column else {
            return Err(analysis_error(format!(
                "SHOW RANGE PARTITIONS requested but table does not have range partitions: {}",
                name
            )));
        };
        let rows = table
            .partitions
            .ranges()
            .iter()
            .map(|r| {
                if r.end == r.start + 1 {
                    format!("VALUE = {}", r.start)
                } else {
                    r.to_string()
                }
            })
            .collect();
        Ok(Outcome::rows(
            vec![format!("RANGE ({})", table.columns[column])],
            rows,
        ))
    }

    fn create_table(&mut self, database: &str, text: &str) -> ImpalaResult<Outcome> {
        let head = pattern(r"(?is)^create\s+table\s+(?P<name>[\w.]+)\s*\(")?;
        let caps = head
            .captures(text)
            .ok_or_else(|| analysis_error("Syntax error in CREATE TABLE"))?;
        let name = caps["name"].to_string();
        let key = Self::qualify(database, &name);
        if self.tables.contains_key(&key) {
            return Err(analysis_error(format!("Table already exists: {}", name)));
        }

        let open = caps.get(0).map(|m| m.end()).unwrap_or_default();
        let close = matching_paren(text, open - 1)
            .ok_or_else(|| analysis_error("Unbalanced parentheses in CREATE TABLE"))?;
        let body = &text[open..close];
        let rest = &text[close + 1..];

        let primary_key_pattern = pattern(r"(?is)^primary\s+key\s*\((?P<columns>[^)]*)\)")?;
        let column_pattern = pattern(r"^(?P<name>\w+)\s+\w+")?;
        let mut columns = Vec::new();
        let mut key_columns = Vec::new();
        for item in split_top_level(body) {
            let item = item.trim();
            if let Some(caps) = primary_key_pattern.captures(item) {
                key_columns = caps["columns"]
                    .split(',')
                    .map(|c| c.trim().to_string())
                    .collect();
            } else if let Some(caps) = column_pattern.captures(item) {
                columns.push(caps["name"].to_string());
            } else if !item.is_empty() {
                return Err(analysis_error(format!("Syntax error near: {}", item)));
            }
        }

        let position = |name: &str| columns.iter().position(|c| c.eq_ignore_ascii_case(name));
        let primary_key = key_columns
            .iter()
            .map(|k| position(k).ok_or_else(|| analysis_error(format!("Unknown key column {}", k))))
            .collect::<ImpalaResult<Vec<_>>>()?;

        let range_pattern = pattern(r"(?i)RANGE\s*\((?P<column>\w+)\)")?;
        let range_column = match range_pattern.captures(rest) {
            Some(caps) => Some(position(&caps["column"]).ok_or_else(|| {
                analysis_error(format!("Unknown range column {}", &caps["column"]))
            })?),
            None => None,
        };

        let mut partitions = PartitionSet::new();
        let value_pattern = pattern(r"(?i)PARTITION\s+VALUE\s*=\s*(?P<value>-?\d+)")?;
        for caps in value_pattern.captures_iter(rest) {
            if let Ok(value) = caps["value"].parse::<i64>() {
                partitions.insert(RangePartition::new(value, value + 1))?;
            }
        }

        self.tables.insert(
            key,
            FakeTable {
                definition: text.trim_end_matches(';').trim().to_string(),
                columns,
                primary_key,
                range_column,
                partitions,
                rows: Vec::new(),
            },
        );
        Ok(Outcome::default())
    }

    fn alter_table(&mut self, database: &str, text: &str) -> ImpalaResult<Outcome> {
        let alter = pattern(
            r"(?is)^alter\s+table\s+(?P<name>[\w.]+)\s+(?P<op>add|drop)\s+range\s+partition\s+(?P<start>-?\d+)\s*<=\s*values\s*<\s*(?P<end>-?\d+)\s*;?$",
        )?;
        let caps = alter
            .captures(text)
            .ok_or_else(|| analysis_error("Unsupported ALTER TABLE"))?;
        let range = match (caps["start"].parse(), caps["end"].parse()) {
            (Ok(start), Ok(end)) => RangePartition::new(start, end),
            _ => return Err(analysis_error("Range bound out of range")),
        };

        let name = caps["name"].to_string();
        let table = self.table_mut(database, &name)?;
        let Some(column) = table.range_column else {
            return Err(analysis_error(format!("Table {} has no range partitions", name)));
        };

        if caps["op"].eq_ignore_ascii_case("add") {
            table.partitions.insert(range)?;
        } else {
            if !table.partitions.remove(&range) {
                return Err(ImpalaError::Server(format!(
                    "No range partition found for {}",
                    range
                )));
            }
            table.rows.retain(|row| {
                row[column]
                    .parse::<i64>()
                    .map(|key| !range.contains(key))
                    .unwrap_or(true)
            });
        }
        Ok(Outcome::default())
    }

    fn insert(&mut self, database: &str, text: &str) -> ImpalaResult<Outcome> {
        let insert = pattern(
            r"(?is)^(?P<verb>insert|upsert)\s+into\s+(?P<name>[\w.]+)\s*\((?P<columns>[^)]*)\)\s*values\s*(?P<values>.*?)\s*;?$",
        )?;
        let caps = insert
            .captures(text)
            .ok_or_else(|| analysis_error("Syntax error in INSERT"))?;
        let upsert = caps["verb"].eq_ignore_ascii_case("upsert");
        let name = caps["name"].to_string();
        let tuples = parse_tuples(&caps["values"])?;
        let forced_errors = self.insert_row_errors;

        let table = self.table_mut(database, &name)?;
        let targets = caps["columns"]
            .split(',')
            .map(|c| {
                let c = c.trim();
                table
                    .column_index(c)
                    .ok_or_else(|| analysis_error(format!("Unknown column {}", c)))
            })
            .collect::<ImpalaResult<Vec<_>>>()?;

        let mut modified = 0;
        let mut errors = Vec::new();
        for tuple in tuples {
            if tuple.len() != targets.len() {
                return Err(analysis_error(format!(
                    "Column permutation mentions {} columns, but the VALUES clause has {}",
                    targets.len(),
                    tuple.len()
                )));
            }
            let mut row = vec![NULL_CELL.to_string(); table.columns.len()];
            for (target, cell) in targets.iter().zip(tuple) {
                row[*target] = cell;
            }

            if let Some(column) = table.range_column {
                let covered = row[column]
                    .parse::<i64>()
                    .map(|key| table.partitions.covers(key))
                    .unwrap_or(false);
                if !covered {
                    errors.push(format!(
                        "Row {} not in any range partition",
                        row.join(", ")
                    ));
                    continue;
                }
            }

            let key = table.key_of(&row);
            let existing = if table.primary_key.is_empty() {
                None
            } else {
                table.rows.iter().position(|r| table.key_of(r) == key)
            };
            match existing {
                Some(index) if upsert => table.rows[index] = row,
                Some(_) => {
                    errors.push(format!("Key already present: ({})", key.join(", ")));
                    continue;
                }
                None => table.rows.push(row),
            }
            modified += 1;
        }

        for n in 0..forced_errors {
            errors.push(format!("Injected row error {}", n + 1));
        }
        Ok(Outcome {
            insert: Some(InsertResult {
                rows_modified: modified,
                row_errors: errors.len() as i64,
            }),
            log: errors.join("\n"),
            ..Outcome::default()
        })
    }

    fn select(&self, database: &str, text: &str) -> ImpalaResult<Outcome> {
        let select = pattern(
            r#"(?is)^select\s+(?P<columns>.+?)\s+from\s+(?P<name>[\w.]+)(?:\s+where\s+(?P<filter>\w+)\s*=\s*(?P<value>"[^"]*"|[^\s;]+))?(?:\s+order\s+by\s+(?P<order>\w+))?\s*;?$"#,
        )?;
        let Some(caps) = select.captures(text) else {
            let constant = pattern(r"(?is)^select\s+(?P<expr>.+?)\s*;?$")?;
            let caps = constant
                .captures(text)
                .ok_or_else(|| analysis_error("Syntax error in SELECT"))?;
            return Ok(Outcome::rows(
                vec!["_c0".into()],
                vec![caps["expr"].to_string()],
            ));
        };

        let table = self.table(database, &caps["name"])?;
        let projection = if caps["columns"].trim() == "*" {
            (0..table.columns.len()).collect::<Vec<_>>()
        } else {
            caps["columns"]
                .split(',')
                .map(|c| {
                    let c = c.trim();
                    table
                        .column_index(c)
                        .ok_or_else(|| analysis_error(format!("Could not resolve column {}", c)))
                })
                .collect::<ImpalaResult<Vec<_>>>()?
        };

        let mut rows: Vec<&Vec<String>> = table.rows.iter().collect();
        if let (Some(filter), Some(value)) = (caps.name("filter"), caps.name("value")) {
            let index = table
                .column_index(filter.as_str())
                .ok_or_else(|| analysis_error(format!("Could not resolve column {}", filter.as_str())))?;
            let value = value.as_str().trim_matches('"');
            rows.retain(|row| row[index] == value);
        }
        if let Some(order) = caps.name("order") {
            let index = table
                .column_index(order.as_str())
                .ok_or_else(|| analysis_error(format!("Could not resolve column {}", order.as_str())))?;
            rows.sort_by(|a, b| match (a[index].parse::<i64>(), b[index].parse::<i64>()) {
                (Ok(x), Ok(y)) => x.cmp(&y),
                _ => a[index].cmp(&b[index]),
            });
        }

        let columns = projection.iter().map(|i| table.columns[*i].clone()).collect();
        let rows = rows
            .iter()
            .map(|row| {
                projection
                    .iter()
                    .map(|i| row[*i].as_str())
                    .collect::<Vec<_>>()
                    .join(self.delimiter.as_str())
            })
            .collect();
        Ok(Outcome::rows(columns, rows))
    }
}

/// Name following `keyword`, without the trailing semicolon
fn trailing_name(text: &str, keyword: &str) -> ImpalaResult<String> {
    let name = text[keyword.len()..].trim().trim_end_matches(';').trim();
    if name.is_empty() {
        return Err(analysis_error(format!("Missing name after {}", keyword)));
    }
    Ok(name.to_string())
}

fn matching_paren(text: &str, open: usize) -> Option<usize> {
    let mut depth = 0usize;
    for (i, c) in text.char_indices().skip_while(|(i, _)| *i < open) {
        match c {
            '(' => depth += 1,
            ')' => {
                depth -= 1;
                if depth == 0 {
                    return Some(i);
                }
            }
            _ => {}
        }
    }
    None
}

fn split_top_level(body: &str) -> Vec<String> {
    let mut items = Vec::new();
    let mut depth = 0usize;
    let mut current = String::new();
    for c in body.chars() {
        match c {
            '(' => depth += 1,
            ')' => depth = depth.saturating_sub(1),
            ',' if depth == 0 => {
                items.push(std::mem::take(&mut current));
                continue;
            }
            _ => {}
        }
        current.push(c);
    }
    items.push(current);
    items
}

/// Parse `(a, "b"), (c, null)` into cells, unescaping string literals
fn parse_tuples(text: &str) -> ImpalaResult<Vec<Vec<String>>> {
    let syntax = || analysis_error("Syntax error in VALUES clause");
    let finish = |cell: &mut String, quoted: &mut bool| {
        let value = if *quoted {
            std::mem::take(cell)
        } else {
            let trimmed = cell.trim();
            let value = if trimmed.eq_ignore_ascii_case("null") {
                NULL_CELL.to_string()
            } else {
                trimmed.to_string()
            };
            cell.clear();
            value
        };
        *quoted = false;
        value
    };

    let mut tuples = Vec::new();
    let mut chars = text.chars();
    loop {
        let next = chars.by_ref().find(|c| !c.is_whitespace() && *c != ',');
        match next {
            None => break,
            Some('(') => {}
            Some(_) => return Err(syntax()),
        }

        let mut row = Vec::new();
        let mut cell = String::new();
        let mut quoted = false;
        loop {
            match chars.next().ok_or_else(syntax)? {
                '"' => {
                    cell.clear();
                    quoted = true;
                    loop {
                        match chars.next().ok_or_else(syntax)? {
                            '\\' => match chars.next().ok_or_else(syntax)? {
                                'n' => cell.push('\n'),
                                other => cell.push(other),
                            },
                            '"' => break,
                            other => cell.push(other),
                        }
                    }
                }
                ',' => row.push(finish(&mut cell, &mut quoted)),
                ')' => {
                    row.push(finish(&mut cell, &mut quoted));
                    break;
                }
                other if !quoted => cell.push(other),
                _ => {}
            }
        }
        tuples.push(row);
    }
    Ok(tuples)
}

struct Execution {
    outcome: Outcome,
    pending: usize,
    cursor: usize,
}

/// One connection to a [`FakeCluster`]
pub struct FakeService {
    cluster: FakeCluster,
    database: String,
    broken: bool,
    executions: HashMap<String, Execution>,
}

impl FakeService {
    fn check_open(&self) -> ImpalaResult<()> {
        if self.broken {
            return Err(ImpalaError::Transport("connection reset by peer".to_string()));
        }
        Ok(())
    }

    fn execution(&mut self, handle: &QueryHandle) -> ImpalaResult<&mut Execution> {
        self.executions
            .get_mut(&handle.id)
            .ok_or_else(|| ImpalaError::Server(format!("Invalid query handle: {}", handle.id)))
    }

    fn finish(&mut self, handle: &QueryHandle) -> ImpalaResult<Execution> {
        let execution = self
            .executions
            .remove(&handle.id)
            .ok_or_else(|| ImpalaError::Server(format!("Invalid query handle: {}", handle.id)))?;
        self.cluster.handle_closed();
        Ok(execution)
    }
}

#[async_trait]
impl ImpalaService for FakeService {
    async fn query(&mut self, statement: &str) -> ImpalaResult<QueryHandle> {
        self.check_open()?;
        match self.cluster.execute(&mut self.database, statement) {
            Ok(execution) => {
                let id = Uuid::new_v4().to_string();
                self.executions.insert(id.clone(), execution);
                Ok(QueryHandle::new(id))
            }
            Err(e) => {
                if e.is_transport() {
                    self.broken = true;
                }
                Err(e)
            }
        }
    }

    async fn fetch(&mut self, handle: &QueryHandle) -> ImpalaResult<FetchResult> {
        self.check_open()?;
        let rows_per_fetch = self.cluster.rows_per_fetch();
        let execution = self.execution(handle)?;
        if execution.pending > 0 {
            execution.pending -= 1;
            return Ok(FetchResult::pending());
        }

        let rows = &execution.outcome.rows;
        let end = (execution.cursor + rows_per_fetch).min(rows.len());
        let batch = rows[execution.cursor..end].to_vec();
        execution.cursor = end;
        let types = vec!["STRING".to_string(); execution.outcome.columns.len()];
        Ok(FetchResult::ready(types, batch, end < rows.len()))
    }

    async fn get_results_metadata(&mut self, handle: &QueryHandle) -> ImpalaResult<ResultsMetadata> {
        self.check_open()?;
        let delimiter = self.cluster.delimiter();
        let execution = self.execution(handle)?;
        Ok(ResultsMetadata {
            schema: execution
                .outcome
                .columns
                .iter()
                .map(|c| FieldSchema::new(c.clone(), "STRING"))
                .collect(),
            delimiter,
        })
    }

    async fn close_insert(&mut self, handle: &QueryHandle) -> ImpalaResult<InsertResult> {
        self.check_open()?;
        let execution = self.finish(handle)?;
        Ok(execution.outcome.insert.unwrap_or_default())
    }

    async fn close(&mut self, handle: &QueryHandle) -> ImpalaResult<()> {
        self.check_open()?;
        self.finish(handle).map(|_| ())
    }

    async fn get_log(&mut self, handle: &QueryHandle) -> ImpalaResult<String> {
        self.check_open()?;
        if let Some(error) = self.cluster.log_failure() {
            if error.is_transport() {
                self.broken = true;
            }
            return Err(error);
        }
        Ok(self.execution(handle)?.outcome.log.clone())
    }
}

/// Connector handing out [`FakeService`] connections
#[derive(Clone)]
pub struct FakeConnector {
    cluster: FakeCluster,
}

impl FakeConnector {
    pub fn new(cluster: FakeCluster) -> Self {
        Self { cluster }
    }
}

#[async_trait]
impl ServiceConnector for FakeConnector {
    async fn connect(&self, host: &HostAddr) -> ImpalaResult<Box<dyn ImpalaService>> {
        self.cluster.open(host)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_tuples_handles_quotes_and_nulls() {
        let tuples = parse_tuples(r#"(1, "a, \"b\"", null), (2,"x\\y" , 3)"#).unwrap();
        assert_eq!(
            tuples,
            vec![
                vec!["1".to_string(), "a, \"b\"".to_string(), "NULL".to_string()],
                vec!["2".to_string(), "x\\y".to_string(), "3".to_string()],
            ]
        );
    }

    #[test]
    fn test_split_top_level_ignores_nested_commas() {
        let items = split_top_level("a INT, PRIMARY KEY (a, b), c STRING");
        assert_eq!(items.len(), 3);
        assert_eq!(items[1].trim(), "PRIMARY KEY (a, b)");
    }

    #[test]
    fn test_range_rules() {
        let cluster = FakeCluster::new();
        let mut database = "default".to_string();
        let mut state = cluster.state.lock();
        state
            .run(
                &mut database,
                "CREATE TABLE t (\n    id BIGINT NOT NULL,\n    at BIGINT NOT NULL,\n    PRIMARY KEY (id, at)\n)\nPARTITION BY RANGE(at) (PARTITION VALUE = 0)\nSTORED AS KUDU\n;",
            )
            .unwrap();
        state
            .run(&mut database, "ALTER TABLE default.t ADD RANGE PARTITION 10 <= VALUES < 20;")
            .unwrap();
        let overlap = state
            .run(&mut database, "ALTER TABLE default.t ADD RANGE PARTITION 15 <= VALUES < 30;")
            .unwrap_err();
        assert!(overlap.is_partition_race());

        let outcome = state
            .run(&mut database, "insert into default.t (id, at) values (1, 12), (2, 25);")
            .unwrap();
        let insert = outcome.insert.unwrap();
        assert_eq!(insert.rows_modified, 1);
        assert_eq!(insert.row_errors, 1);
    }

    #[test]
    fn test_statement_prefix_skips_show_create() {
        let cluster = FakeCluster::new();
        let mut database = "default".to_string();
        for statement in [
            "CREATE TABLE t (\n    id BIGINT NOT NULL,\n    PRIMARY KEY (id)\n)\nSTORED AS KUDU\n;",
            "show create table default.t;",
        ] {
            cluster.execute(&mut database, statement).unwrap();
        }
        assert_eq!(cluster.statements_matching("create table").len(), 2);
        assert_eq!(cluster.statements_starting_with("create table").len(), 1);
    }
}
