//! In-Memory Search Engine
//!
//! A small reference implementation of [`Backend`] that keeps documents in
//! memory, grouped by project and database name. It understands the
//! database selection commands, term and parsed queries combined with
//! boolean operators, totals (cached) and paged results.
//!
//! ## Data Layout
//!
//! ```text
//! MemoryBackend
//!   └── indexes: (project, db) → [Document, ...]
//!   └── totals:  LruStore<query key, u32>
//!
//! MemorySearch (one per paused connection)
//!   ├── dbs:   ["db", ...]       selected databases
//!   ├── query: [(op, clause)]    built by QUERY_* commands
//!   └── sort:  relevance | docid
//! ```
//!
//! Matching is done on lowercased whitespace-separated words of the
//! document body and its fields. Ranking is the number of query terms a
//! document contains.

use crate::protocol::{ok, opcode, Command, ErrorCode};
use crate::session::Session;
use crate::storage::backend::{Backend, BackendError, Response, SearchContext};
use crate::storage::cache::{Cache, LruStore};
use parking_lot::RwLock;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt::Write as _;
use std::sync::Arc;
use tracing::{debug, trace};

/// Database selected when a search context opens.
pub const DEFAULT_DB: &str = "db";

/// Value number used for the document body in result fields.
pub const BODY_VNO: u16 = 255;

/// Default page size when GET_RESULT carries no limits.
const DEFAULT_LIMIT: u32 = 10;

/// Size of the document record in a RESULT_DOC frame.
pub const RESULT_DOC_LEN: usize = 20;

/// An indexed document.
#[derive(Debug, Clone, PartialEq)]
pub struct Document {
    pub id: u32,
    pub body: String,
    pub fields: BTreeMap<u16, String>,
}

impl Document {
    pub fn new(id: u32, body: impl Into<String>) -> Self {
        Self {
            id,
            body: body.into(),
            fields: BTreeMap::new(),
        }
    }

    pub fn with_field(mut self, vno: u16, value: impl Into<String>) -> Self {
        self.fields.insert(vno, value.into());
        self
    }

    fn words(&self) -> BTreeSet<String> {
        std::iter::once(self.body.as_str())
            .chain(self.fields.values().map(String::as_str))
            .flat_map(str::split_whitespace)
            .map(str::to_lowercase)
            .collect()
    }
}

#[derive(Debug, Default)]
struct Shared {
    indexes: RwLock<HashMap<(String, String), Arc<Vec<Document>>>>,
}

/// Memory-resident search backend.
#[derive(Clone)]
pub struct MemoryBackend {
    shared: Arc<Shared>,
    totals: Arc<LruStore<String, u32>>,
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new(1024)
    }
}

impl MemoryBackend {
    /// Creates an empty backend whose total-count cache holds
    /// `cache_capacity` entries.
    pub fn new(cache_capacity: usize) -> Self {
        Self {
            shared: Arc::new(Shared::default()),
            totals: Arc::new(LruStore::new(cache_capacity)),
        }
    }

    /// Adds a document to `project`/`db`, creating the database if needed.
    pub fn insert(&self, project: &str, db: &str, doc: Document) {
        let mut indexes = self.shared.indexes.write();
        let docs = indexes
            .entry((project.to_string(), db.to_string()))
            .or_insert_with(|| Arc::new(Vec::new()));
        Arc::make_mut(docs).push(doc);
    }

    /// Creates an empty database.
    pub fn create_db(&self, project: &str, db: &str) {
        self.shared
            .indexes
            .write()
            .entry((project.to_string(), db.to_string()))
            .or_insert_with(|| Arc::new(Vec::new()));
    }
}

impl Backend for MemoryBackend {
    fn open(&self, session: &Session) -> Result<Box<dyn SearchContext>, BackendError> {
        let mut search = MemorySearch {
            project: session.name().to_string(),
            shared: Arc::clone(&self.shared),
            totals: Arc::clone(&self.totals),
            dbs: Vec::new(),
            query: Vec::new(),
            sort: Sort::Relevance,
        };
        if search.exists(DEFAULT_DB) {
            search.dbs.push(DEFAULT_DB.to_string());
        }
        debug!(project = session.name(), dbs = ?search.dbs, "search context opened");
        Ok(Box::new(search))
    }
}

/// Boolean operator joining a clause to the query built so far.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Op {
    And,
    Or,
    AndNot,
    Xor,
    AndMaybe,
    Filter,
}

impl Op {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => Op::Or,
            2 => Op::AndNot,
            3 => Op::Xor,
            4 => Op::AndMaybe,
            5 => Op::Filter,
            _ => Op::And,
        }
    }

    fn label(self) -> &'static str {
        match self {
            Op::And => "AND",
            Op::Or => "OR",
            Op::AndNot => "AND_NOT",
            Op::Xor => "XOR",
            Op::AndMaybe => "AND_MAYBE",
            Op::Filter => "FILTER",
        }
    }
}

/// A query clause: one term or a group of terms joined by one operator.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Clause {
    op: Op,
    terms: Vec<String>,
}

impl Clause {
    fn parse(text: &str, op: Op, sep: char) -> Option<Self> {
        let terms: Vec<String> = text
            .split(sep)
            .flat_map(str::split_whitespace)
            .map(str::to_lowercase)
            .collect();
        (!terms.is_empty()).then_some(Self { op, terms })
    }

    fn matches(&self, words: &BTreeSet<String>) -> bool {
        let mut hits = self.terms.iter().map(|t| words.contains(t));
        match self.op {
            Op::Or | Op::AndMaybe => hits.any(|h| h),
            Op::Xor => hits.filter(|&h| h).count() % 2 == 1,
            Op::AndNot => {
                let first = hits.next().unwrap_or(false);
                first && !hits.any(|h| h)
            }
            Op::And | Op::Filter => hits.all(|h| h),
        }
    }

    fn describe(&self) -> String {
        if self.terms.len() == 1 {
            return self.terms[0].clone();
        }
        format!("({})", self.terms.join(&format!(" {} ", self.op.label())))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Sort {
    Relevance,
    DocId { ascending: bool },
}

/// Per-connection state of the in-memory engine.
struct MemorySearch {
    project: String,
    shared: Arc<Shared>,
    totals: Arc<LruStore<String, u32>>,
    dbs: Vec<String>,
    query: Vec<(Op, Clause)>,
    sort: Sort,
}

struct Hit<'a> {
    doc: &'a Document,
    score: u32,
}

impl MemorySearch {
    fn exists(&self, db: &str) -> bool {
        self.shared
            .indexes
            .read()
            .contains_key(&(self.project.clone(), db.to_string()))
    }

    fn snapshot(&self) -> Vec<Arc<Vec<Document>>> {
        let indexes = self.shared.indexes.read();
        self.dbs
            .iter()
            .filter_map(|db| indexes.get(&(self.project.clone(), db.clone())).cloned())
            .collect()
    }

    /// The query to run: the one carried by the command, else the one built
    /// so far with QUERY_* commands.
    fn effective_query(&self, cmd: &Command<'_>) -> Vec<(Op, Clause)> {
        let text = cmd.primary_str();
        match Clause::parse(&text, Op::from_u8(cmd.arg2()), ' ') {
            Some(clause) => vec![(Op::And, clause)],
            None => self.query.clone(),
        }
    }

    fn describe(query: &[(Op, Clause)]) -> String {
        let mut out = String::from("Query(");
        for (i, (op, clause)) in query.iter().enumerate() {
            if i > 0 {
                let _ = write!(out, " {} ", op.label());
            }
            out.push_str(&clause.describe());
        }
        out.push(')');
        out
    }

    fn search<'a>(docs: &'a [Arc<Vec<Document>>], query: &[(Op, Clause)], sort: Sort) -> Vec<Hit<'a>> {
        let mut hits = Vec::new();
        for doc in docs.iter().flat_map(|db| db.iter()) {
            let words = doc.words();
            let mut matched = false;
            for (i, (op, clause)) in query.iter().enumerate() {
                let hit = clause.matches(&words);
                matched = match (i, op) {
                    (0, _) => hit,
                    (_, Op::And) | (_, Op::Filter) => matched && hit,
                    (_, Op::Or) => matched || hit,
                    (_, Op::AndNot) => matched && !hit,
                    (_, Op::Xor) => matched != hit,
                    (_, Op::AndMaybe) => matched,
                };
            }
            if matched {
                let score = query
                    .iter()
                    .flat_map(|(_, c)| c.terms.iter())
                    .filter(|t| words.contains(*t))
                    .count() as u32;
                hits.push(Hit { doc, score });
            }
        }
        match sort {
            Sort::Relevance => hits.sort_by(|a, b| b.score.cmp(&a.score).then(a.doc.id.cmp(&b.doc.id))),
            Sort::DocId { ascending: true } => hits.sort_by_key(|h| h.doc.id),
            Sort::DocId { ascending: false } => hits.sort_by(|a, b| b.doc.id.cmp(&a.doc.id)),
        }
        hits
    }

    fn total_terms(query: &[(Op, Clause)]) -> u32 {
        query.iter().map(|(_, c)| c.terms.len() as u32).sum()
    }

    fn set_db(&mut self, cmd: &Command<'_>, replace: bool) -> Response {
        let name = cmd.primary_str().into_owned();
        let name = if name.is_empty() { DEFAULT_DB.to_string() } else { name };
        if !self.exists(&name) {
            return Response::one(Command::err_with(
                ErrorCode::NoDb,
                format!("database not found: {name}"),
            ));
        }
        if replace {
            self.dbs.clear();
        }
        if !self.dbs.contains(&name) {
            self.dbs.push(name);
        }
        Response::one(Command::empty(opcode::OK, ok::DB_CHANGED))
    }

    fn get_total(&mut self, cmd: &Command<'_>) -> Response {
        if self.dbs.is_empty() {
            return Response::one(Command::err(ErrorCode::NoDb));
        }
        let query = self.effective_query(cmd);
        if query.is_empty() {
            return Response::one(Command::err(ErrorCode::EmptyQuery));
        }

        let key = format!("{}|{}|{}", self.project, self.dbs.join(","), Self::describe(&query));
        let count = match self.totals.get(&key) {
            Some(count) => {
                trace!(key = %key, "search total found in cache");
                count
            }
            None => {
                let docs = self.snapshot();
                let count = Self::search(&docs, &query, self.sort).len() as u32;
                self.totals.put(key, count);
                count
            }
        };
        Response::one(Command::ok(ok::SEARCH_TOTAL, count.to_le_bytes().to_vec()))
    }

    fn get_result(&mut self, cmd: &Command<'_>) -> Result<Response, BackendError> {
        if self.dbs.is_empty() {
            return Ok(Response::one(Command::err(ErrorCode::NoDb)));
        }
        let query = self.effective_query(cmd);
        if query.is_empty() {
            return Ok(Response::one(Command::err(ErrorCode::EmptyQuery)));
        }

        let (offset, limit) = match cmd.secondary() {
            [] => (0, DEFAULT_LIMIT),
            raw if raw.len() == 8 => (
                u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]),
                u32::from_le_bytes([raw[4], raw[5], raw[6], raw[7]]),
            ),
            _ => return Err(BackendError::WrongFormat),
        };

        let docs = self.snapshot();
        let hits = Self::search(&docs, &query, self.sort);
        let terms = Self::total_terms(&query).max(1);

        let mut frames = vec![Command::ok(
            ok::RESULT_BEGIN,
            (hits.len() as u32).to_le_bytes().to_vec(),
        )];
        for (rank, hit) in hits
            .iter()
            .enumerate()
            .skip(offset as usize)
            .take(limit as usize)
        {
            let percent = (hit.score * 100 / terms) as i32;
            let mut record = Vec::with_capacity(RESULT_DOC_LEN);
            record.extend_from_slice(&hit.doc.id.to_le_bytes());
            record.extend_from_slice(&(rank as u32 + 1).to_le_bytes());
            record.extend_from_slice(&0u32.to_le_bytes());
            record.extend_from_slice(&percent.to_le_bytes());
            record.extend_from_slice(&(hit.score as f32).to_le_bytes());
            frames.push(Command::new(opcode::SEARCH_RESULT_DOC, 0, record));

            for (vno, value) in &hit.doc.fields {
                frames.push(Command::new(
                    opcode::SEARCH_RESULT_FIELD,
                    *vno,
                    value.as_bytes(),
                ));
            }
            frames.push(Command::new(
                opcode::SEARCH_RESULT_FIELD,
                BODY_VNO,
                hit.doc.body.as_bytes(),
            ));
        }
        frames.push(Command::empty(opcode::OK, ok::RESULT_END));
        Ok(Response::Frames(frames))
    }

    fn get_query(&self, cmd: &Command<'_>) -> Response {
        let query = self.effective_query(cmd);
        if cmd.opcode() == opcode::QUERY_GET_TERMS {
            let terms: Vec<&str> = query
                .iter()
                .flat_map(|(_, c)| c.terms.iter().map(String::as_str))
                .collect();
            return Response::one(Command::ok(ok::QUERY_TERMS, terms.join(" ")));
        }
        Response::one(Command::ok(ok::QUERY_STRING, Self::describe(&query)))
    }

    fn add_query(&mut self, cmd: &Command<'_>) -> Response {
        let text = cmd.primary_str();
        let clause = match cmd.opcode() {
            opcode::QUERY_TERM => Clause::parse(&text, Op::And, '\0'),
            opcode::QUERY_TERMS => Clause::parse(&text, Op::from_u8(cmd.arg2()), '\t'),
            _ => Clause::parse(&text, Op::from_u8(cmd.arg2()), ' '),
        };
        if let Some(clause) = clause {
            self.query.push((Op::from_u8(cmd.arg1()), clause));
        }
        Response::none()
    }

    fn db_total(&self) -> Response {
        if self.dbs.is_empty() {
            return Response::one(Command::err(ErrorCode::NoDb));
        }
        let total: usize = self.snapshot().iter().map(|db| db.len()).sum();
        Response::one(Command::ok(ok::DB_TOTAL, (total as u32).to_le_bytes().to_vec()))
    }
}

impl SearchContext for MemorySearch {
    fn execute(&mut self, cmd: &Command<'_>) -> Result<Response, BackendError> {
        trace!(opcode = opcode::name(cmd.opcode()), "memory backend command");
        let response = match cmd.opcode() {
            opcode::SEARCH_SET_DB => self.set_db(cmd, true),
            opcode::SEARCH_ADD_DB => self.set_db(cmd, false),
            opcode::SEARCH_GET_DB => {
                if self.dbs.is_empty() {
                    Response::one(Command::err(ErrorCode::NoDb))
                } else {
                    Response::one(Command::ok(ok::DB_INFO, self.dbs.join(",")))
                }
            }
            opcode::SEARCH_DB_TOTAL => self.db_total(),
            opcode::SEARCH_GET_TOTAL => self.get_total(cmd),
            opcode::SEARCH_GET_RESULT => self.get_result(cmd)?,
            opcode::SEARCH_ADD_LOG => Response::one(Command::empty(opcode::OK, ok::LOGGED)),
            opcode::QUERY_GET_STRING | opcode::QUERY_GET_TERMS => self.get_query(cmd),
            opcode::QUERY_INIT => {
                self.query.clear();
                Response::none()
            }
            opcode::QUERY_TERM | opcode::QUERY_TERMS | opcode::QUERY_PARSE => self.add_query(cmd),
            opcode::SEARCH_SET_SORT => {
                self.sort = match cmd.arg1() & 0x3f {
                    1 => Sort::DocId {
                        ascending: cmd.arg1() & 0x80 != 0,
                    },
                    _ => Sort::Relevance,
                };
                Response::none()
            }
            opcode::SEARCH_SET_CUT
            | opcode::SEARCH_SET_NUMERIC
            | opcode::SEARCH_SET_COLLAPSE
            | opcode::SEARCH_SET_FACETS
            | opcode::SEARCH_SET_CUTOFF
            | opcode::SEARCH_SET_MISC
            | opcode::QUERY_RANGEPROC
            | opcode::QUERY_PREFIX
            | opcode::QUERY_PARSEFLAG => Response::none(),
            _ => Response::Unhandled,
        };
        Ok(response)
    }

    fn databases(&self) -> Vec<String> {
        self.dbs.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::SessionRegistry;

    fn open(backend: &MemoryBackend) -> (tempfile::TempDir, Box<dyn SearchContext>) {
        let dir = tempfile::tempdir().unwrap();
        let registry = SessionRegistry::new(dir.path(), 4);
        let session = registry.open(b"demo", b"").unwrap();
        let search = backend.open(&session).unwrap();
        (dir, search)
    }

    fn frames(response: Response) -> Vec<Command<'static>> {
        match response {
            Response::Frames(frames) => frames,
            Response::Unhandled => panic!("command not handled"),
        }
    }

    fn sample() -> MemoryBackend {
        let backend = MemoryBackend::new(16);
        backend.insert("demo", "db", Document::new(1, "rust search server").with_field(1, "title one"));
        backend.insert("demo", "db", Document::new(2, "rust thread pool"));
        backend.insert("demo", "db", Document::new(3, "python search"));
        backend
    }

    #[test]
    fn test_total_with_inline_query() {
        let backend = sample();
        let (_dir, mut search) = open(&backend);

        let cmd = Command::new(opcode::SEARCH_GET_TOTAL, 0, "rust");
        let out = frames(search.execute(&cmd).unwrap());
        assert_eq!(out[0].arg(), ok::SEARCH_TOTAL);
        assert_eq!(out[0].primary(), &2u32.to_le_bytes());
    }

    #[test]
    fn test_built_query_with_operators() {
        let backend = sample();
        let (_dir, mut search) = open(&backend);

        search
            .execute(&Command::new(opcode::QUERY_TERM, 0, "search"))
            .unwrap();
        // arg1 = 2: AND_NOT
        search
            .execute(&Command::new(opcode::QUERY_TERM, 0x0200, "python"))
            .unwrap();

        let out = frames(
            search
                .execute(&Command::empty(opcode::QUERY_GET_STRING, 0))
                .unwrap(),
        );
        assert_eq!(out[0].primary(), b"Query(search AND_NOT python)");

        let out = frames(
            search
                .execute(&Command::empty(opcode::SEARCH_GET_TOTAL, 0))
                .unwrap(),
        );
        assert_eq!(out[0].primary(), &1u32.to_le_bytes());
    }

    #[test]
    fn test_result_frames() {
        let backend = sample();
        let (_dir, mut search) = open(&backend);

        let mut limits = Vec::new();
        limits.extend_from_slice(&0u32.to_le_bytes());
        limits.extend_from_slice(&1u32.to_le_bytes());
        let cmd = Command::with_secondary(opcode::SEARCH_GET_RESULT, 0, b"rust search", &limits);
        let out = frames(search.execute(&cmd).unwrap());

        // begin, doc, field 1, body field, end
        assert_eq!(out.len(), 5);
        assert_eq!(out[0].arg(), ok::RESULT_BEGIN);
        assert_eq!(out[0].primary(), &1u32.to_le_bytes());
        assert_eq!(out[1].opcode(), opcode::SEARCH_RESULT_DOC);
        assert_eq!(out[1].primary().len(), RESULT_DOC_LEN);
        assert_eq!(&out[1].primary()[..4], &1u32.to_le_bytes());
        assert_eq!(out[2].arg(), 1);
        assert_eq!(out[3].arg(), BODY_VNO);
        assert_eq!(out[4].arg(), ok::RESULT_END);
    }

    #[test]
    fn test_bad_limits_are_a_format_error() {
        let backend = sample();
        let (_dir, mut search) = open(&backend);

        let cmd = Command::with_secondary(opcode::SEARCH_GET_RESULT, 0, b"rust", b"bad");
        let err = search.execute(&cmd).unwrap_err();
        assert_eq!(err.code(), ErrorCode::WrongFormat);
    }

    #[test]
    fn test_missing_database() {
        let backend = sample();
        let (_dir, mut search) = open(&backend);

        let out = frames(
            search
                .execute(&Command::new(opcode::SEARCH_SET_DB, 0, "other"))
                .unwrap(),
        );
        assert_eq!(out[0].opcode(), opcode::ERR);
        assert_eq!(out[0].arg(), ErrorCode::NoDb.code());
        assert_eq!(search.databases(), vec!["db".to_string()]);

        backend.create_db("demo", "other");
        search
            .execute(&Command::new(opcode::SEARCH_ADD_DB, 0, "other"))
            .unwrap();
        assert_eq!(search.databases(), vec!["db".to_string(), "other".to_string()]);
    }

    #[test]
    fn test_empty_query() {
        let backend = sample();
        let (_dir, mut search) = open(&backend);

        let out = frames(
            search
                .execute(&Command::empty(opcode::SEARCH_GET_TOTAL, 0))
                .unwrap(),
        );
        assert_eq!(out[0].arg(), ErrorCode::EmptyQuery.code());
    }

    #[test]
    fn test_unknown_command_is_unhandled() {
        let backend = sample();
        let (_dir, mut search) = open(&backend);

        let response = search
            .execute(&Command::empty(opcode::QUERY_GET_CORRECTED, 0))
            .unwrap();
        assert!(matches!(response, Response::Unhandled));
    }
}
