use crate::academic_year::AcademicYearWindow;
use rusqlite::{params_from_iter, types::Value, Connection, OptionalExtension};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store query failed: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("unexpected value in column {column}: {found}")]
    UnexpectedValue { column: &'static str, found: String },
}

#[derive(Debug, Error)]
pub enum ResultsError {
    #[error("no assessment bound; call bind() before querying")]
    Unbound,

    #[error("collection {0} not found")]
    CollectionNotFound(String),

    #[error("no academic year window for year {year} starting in month {start_month}")]
    AcademicYear { year: i32, start_month: u32 },

    #[error(transparent)]
    Store(#[from] StoreError),
}

pub type Row = Vec<Value>;

/// Read access to the relational store. Parameters are always positional and
/// typed; only table names (through `table`) are spliced into query text.
pub trait Store {
    fn table(&self, name: &str) -> String;
    fn fetch_all(&self, sql: &str, params: &[Value]) -> Result<Vec<Row>, StoreError>;
    fn fetch_one(&self, sql: &str, params: &[Value]) -> Result<Option<Value>, StoreError>;
    fn fetch_first_column(&self, sql: &str, params: &[Value]) -> Result<Vec<Value>, StoreError>;
}

pub struct SqliteStore<'a> {
    conn: &'a Connection,
    prefix: String,
}

impl<'a> SqliteStore<'a> {
    pub fn new(conn: &'a Connection, prefix: impl Into<String>) -> Self {
        Self {
            conn,
            prefix: prefix.into(),
        }
    }
}

impl Store for SqliteStore<'_> {
    fn table(&self, name: &str) -> String {
        crate::db::table_name(&self.prefix, name)
    }

    fn fetch_all(&self, sql: &str, params: &[Value]) -> Result<Vec<Row>, StoreError> {
        let mut stmt = self.conn.prepare(sql)?;
        let width = stmt.column_count();
        let rows = stmt
            .query_map(params_from_iter(params.iter()), |r| {
                (0..width)
                    .map(|i| r.get::<_, Value>(i))
                    .collect::<Result<Vec<_>, _>>()
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    fn fetch_one(&self, sql: &str, params: &[Value]) -> Result<Option<Value>, StoreError> {
        let v = self
            .conn
            .query_row(sql, params_from_iter(params.iter()), |r| r.get::<_, Value>(0))
            .optional()?;
        Ok(v)
    }

    fn fetch_first_column(&self, sql: &str, params: &[Value]) -> Result<Vec<Value>, StoreError> {
        let mut stmt = self.conn.prepare(sql)?;
        let values = stmt
            .query_map(params_from_iter(params.iter()), |r| r.get::<_, Value>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(values)
    }
}

fn text(v: &str) -> Value {
    Value::Text(v.to_string())
}

fn describe(v: &Value) -> String {
    match v {
        Value::Null => "NULL".to_string(),
        Value::Integer(n) => n.to_string(),
        Value::Real(x) => x.to_string(),
        Value::Text(s) => format!("{:?}", s),
        Value::Blob(b) => format!("<{} byte blob>", b.len()),
    }
}

fn int_value(v: &Value, column: &'static str) -> Result<i64, StoreError> {
    match v {
        Value::Integer(n) => Ok(*n),
        other => Err(StoreError::UnexpectedValue {
            column,
            found: describe(other),
        }),
    }
}

fn text_value(v: &Value, column: &'static str) -> Result<String, StoreError> {
    match v {
        Value::Text(s) => Ok(s.clone()),
        Value::Integer(n) => Ok(n.to_string()),
        other => Err(StoreError::UnexpectedValue {
            column,
            found: describe(other),
        }),
    }
}

fn cell<'r>(row: &'r Row, idx: usize, column: &'static str) -> Result<&'r Value, StoreError> {
    row.get(idx).ok_or_else(|| StoreError::UnexpectedValue {
        column,
        found: "missing column".to_string(),
    })
}

fn count_value(v: Option<Value>) -> Result<i64, StoreError> {
    match v {
        None | Some(Value::Null) => Ok(0),
        Some(v) => int_value(&v, "count"),
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Assessment {
    pub id: String,
    pub module_id: i64,
    pub name: String,
    pub collection_id: String,
    pub open_date: String,
    pub close_date: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Group {
    pub id: String,
    pub name: String,
    pub members: Vec<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Collection {
    pub id: String,
    pub module_id: i64,
    pub name: String,
    pub groups: Vec<Group>,
}

impl Collection {
    pub fn group_id_exists(&self, group_id: &str) -> bool {
        self.groups.iter().any(|g| g.id == group_id)
    }

    /// Every member across all groups, ascending, each once.
    pub fn member_ids(&self) -> Vec<i64> {
        self.groups
            .iter()
            .flat_map(|g| g.members.iter().copied())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UserMark {
    pub group_id: String,
    pub user_id: i64,
    pub marked_user_id: i64,
    pub question_id: i64,
    pub score: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupResponseCount {
    pub group_id: String,
    pub group_name: String,
    pub responded: i64,
    pub members: i64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AssessmentParticipation {
    pub responses: i64,
    pub members: i64,
}

pub trait CollectionProvider {
    /// `Ok(None)` when no collection has this id.
    fn resolve(&self, collection_id: &str) -> Result<Option<Collection>, StoreError>;
}

/// Reads collections, their groups and members from the same store.
pub struct StoreCollectionProvider<'s> {
    store: &'s dyn Store,
}

impl<'s> StoreCollectionProvider<'s> {
    pub fn new(store: &'s dyn Store) -> Self {
        Self { store }
    }
}

impl CollectionProvider for StoreCollectionProvider<'_> {
    fn resolve(&self, collection_id: &str) -> Result<Option<Collection>, StoreError> {
        let header = self.store.fetch_all(
            &format!(
                "SELECT collection_id, module_id, collection_name FROM {} WHERE collection_id = ?",
                self.store.table("user_collection")
            ),
            &[text(collection_id)],
        )?;
        let Some(row) = header.first() else {
            return Ok(None);
        };
        let id = text_value(cell(row, 0, "collection_id")?, "collection_id")?;
        let module_id = int_value(cell(row, 1, "module_id")?, "module_id")?;
        let name = text_value(cell(row, 2, "collection_name")?, "collection_name")?;

        let group_rows = self.store.fetch_all(
            &format!(
                "SELECT group_id, group_name FROM {} WHERE collection_id = ? ORDER BY group_name, group_id",
                self.store.table("user_group")
            ),
            &[text(collection_id)],
        )?;
        let member_rows = self.store.fetch_all(
            &format!(
                "SELECT ugm.group_id, ugm.user_id
                 FROM {} ugm
                 INNER JOIN {} ug ON ugm.group_id = ug.group_id
                 WHERE ug.collection_id = ?
                 ORDER BY ugm.group_id, ugm.user_id",
                self.store.table("user_group_member"),
                self.store.table("user_group")
            ),
            &[text(collection_id)],
        )?;

        let mut members_by_group: HashMap<String, Vec<i64>> = HashMap::new();
        for r in &member_rows {
            let gid = text_value(cell(r, 0, "group_id")?, "group_id")?;
            let uid = int_value(cell(r, 1, "user_id")?, "user_id")?;
            members_by_group.entry(gid).or_default().push(uid);
        }

        let mut groups = Vec::with_capacity(group_rows.len());
        for r in &group_rows {
            let gid = text_value(cell(r, 0, "group_id")?, "group_id")?;
            let gname = text_value(cell(r, 1, "group_name")?, "group_name")?;
            let members = members_by_group.remove(&gid).unwrap_or_default();
            groups.push(Group {
                id: gid,
                name: gname,
                members,
            });
        }

        Ok(Some(Collection {
            id,
            module_id,
            name,
            groups,
        }))
    }
}

pub fn load_assessment(store: &dyn Store, assessment_id: &str) -> Result<Option<Assessment>, StoreError> {
    let rows = store.fetch_all(
        &format!(
            "SELECT assessment_id, module_id, assessment_name, collection_id, open_date, close_date
             FROM {}
             WHERE assessment_id = ?",
            store.table("assessment")
        ),
        &[text(assessment_id)],
    )?;
    let Some(r) = rows.first() else {
        return Ok(None);
    };
    Ok(Some(Assessment {
        id: text_value(cell(r, 0, "assessment_id")?, "assessment_id")?,
        module_id: int_value(cell(r, 1, "module_id")?, "module_id")?,
        name: text_value(cell(r, 2, "assessment_name")?, "assessment_name")?,
        collection_id: text_value(cell(r, 3, "collection_id")?, "collection_id")?,
        open_date: text_value(cell(r, 4, "open_date")?, "open_date")?,
        close_date: text_value(cell(r, 5, "close_date")?, "close_date")?,
    }))
}

fn module_filter(module_id: i64, window: Option<&AcademicYearWindow>) -> (String, Vec<Value>) {
    let mut clause = "WHERE a.module_id = ?".to_string();
    let mut params = vec![Value::Integer(module_id)];
    if let Some(w) = window {
        let (start, end) = w.bounds_as_sql();
        clause.push_str(" AND a.open_date >= ? AND a.open_date < ?");
        params.push(Value::Text(start));
        params.push(Value::Text(end));
    }
    (clause, params)
}

fn counts_by_assessment(rows: Vec<Row>) -> Result<BTreeMap<String, i64>, StoreError> {
    let mut out = BTreeMap::new();
    for r in &rows {
        let id = text_value(cell(r, 0, "assessment_id")?, "assessment_id")?;
        let n = int_value(cell(r, 1, "count")?, "count")?;
        out.insert(id, n);
    }
    Ok(out)
}

/// Distinct assessors per assessment of a module. Assessments without marks map to 0.
fn module_response_counts(
    store: &dyn Store,
    module_id: i64,
    window: Option<&AcademicYearWindow>,
) -> Result<BTreeMap<String, i64>, StoreError> {
    let (filter, params) = module_filter(module_id, window);
    let sql = format!(
        "SELECT a.assessment_id, COUNT(DISTINCT um.user_id)
         FROM {} a
         LEFT JOIN {} um ON a.assessment_id = um.assessment_id
         {}
         GROUP BY a.assessment_id
         ORDER BY a.assessment_id",
        store.table("assessment"),
        store.table("user_mark"),
        filter
    );
    counts_by_assessment(store.fetch_all(&sql, &params)?)
}

/// Distinct group members per assessment of a module, i.e. who could respond.
fn module_member_counts(
    store: &dyn Store,
    module_id: i64,
    window: Option<&AcademicYearWindow>,
) -> Result<BTreeMap<String, i64>, StoreError> {
    let (filter, params) = module_filter(module_id, window);
    let sql = format!(
        "SELECT a.assessment_id, COUNT(DISTINCT ugm.user_id)
         FROM {} a
         LEFT JOIN {} ug ON a.collection_id = ug.collection_id
         LEFT JOIN {} ugm ON ug.group_id = ugm.group_id
         {}
         GROUP BY a.assessment_id
         ORDER BY a.assessment_id",
        store.table("assessment"),
        store.table("user_group"),
        store.table("user_group_member"),
        filter
    );
    counts_by_assessment(store.fetch_all(&sql, &params)?)
}

fn merge_participation(
    responses: &BTreeMap<String, i64>,
    members: &BTreeMap<String, i64>,
) -> BTreeMap<String, AssessmentParticipation> {
    let mut out: BTreeMap<String, AssessmentParticipation> = BTreeMap::new();
    for (id, n) in responses {
        out.entry(id.clone()).or_default().responses = *n;
    }
    for (id, n) in members {
        out.entry(id.clone()).or_default().members = *n;
    }
    out
}

/// Cross-assessment counts for one module. Needs no bound assessment; the
/// aggregator delegates its module-wide queries here.
///
/// `user_id` never narrows a result: the counts cover the whole module and the
/// id is only recorded in the log line.
pub struct ModuleScope<'a> {
    store: &'a dyn Store,
    module_id: i64,
    academic_year_start_month: u32,
}

impl<'a> ModuleScope<'a> {
    pub fn new(store: &'a dyn Store, module_id: i64, academic_year_start_month: u32) -> Self {
        Self {
            store,
            module_id,
            academic_year_start_month,
        }
    }

    pub fn module_id(&self) -> i64 {
        self.module_id
    }

    /// Window for `academic_year`. Absent and year 0 both mean every year.
    pub fn window(&self, academic_year: Option<i32>) -> Result<Option<AcademicYearWindow>, ResultsError> {
        let year = match academic_year {
            None | Some(0) => return Ok(None),
            Some(year) => year,
        };
        AcademicYearWindow::new(year, self.academic_year_start_month)
            .map(Some)
            .ok_or(ResultsError::AcademicYear {
                year,
                start_month: self.academic_year_start_month,
            })
    }

    pub fn response_counts(
        &self,
        user_id: i64,
        academic_year: Option<i32>,
    ) -> Result<BTreeMap<String, i64>, ResultsError> {
        let window = self.window(academic_year)?;
        debug!(user_id, module_id = self.module_id, ?academic_year, "module response counts");
        Ok(module_response_counts(self.store, self.module_id, window.as_ref())?)
    }

    pub fn member_counts(
        &self,
        user_id: i64,
        academic_year: Option<i32>,
    ) -> Result<BTreeMap<String, i64>, ResultsError> {
        let window = self.window(academic_year)?;
        debug!(user_id, module_id = self.module_id, ?academic_year, "module member counts");
        Ok(module_member_counts(self.store, self.module_id, window.as_ref())?)
    }

    pub fn overview(
        &self,
        user_id: i64,
        academic_year: Option<i32>,
    ) -> Result<BTreeMap<String, AssessmentParticipation>, ResultsError> {
        let responses = self.response_counts(user_id, academic_year)?;
        let members = self.member_counts(user_id, academic_year)?;
        Ok(merge_participation(&responses, &members))
    }
}

#[derive(Debug)]
struct Binding {
    assessment: Arc<Assessment>,
    collection_id: String,
    collection: Collection,
}

/// Response statistics for one bound assessment, plus module-wide counts for
/// the module the aggregator was created for.
pub struct ResultAggregator<'a> {
    store: &'a dyn Store,
    collections: &'a dyn CollectionProvider,
    scope: ModuleScope<'a>,
    binding: Option<Binding>,
}

impl<'a> ResultAggregator<'a> {
    pub fn new(
        store: &'a dyn Store,
        collections: &'a dyn CollectionProvider,
        module_id: i64,
        academic_year_start_month: u32,
    ) -> Self {
        Self {
            store,
            collections,
            scope: ModuleScope::new(store, module_id, academic_year_start_month),
            binding: None,
        }
    }

    pub fn module_id(&self) -> i64 {
        self.scope.module_id()
    }

    pub fn bind(&mut self, assessment: Arc<Assessment>) -> Result<(), ResultsError> {
        let collection_id = assessment.collection_id.clone();
        let Some(collection) = self.collections.resolve(&collection_id)? else {
            return Err(ResultsError::CollectionNotFound(collection_id));
        };
        debug!(
            assessment_id = %assessment.id,
            collection_id = %collection_id,
            groups = collection.groups.len(),
            "bound assessment"
        );
        self.binding = Some(Binding {
            assessment,
            collection_id,
            collection,
        });
        Ok(())
    }

    fn binding(&self) -> Result<&Binding, ResultsError> {
        self.binding.as_ref().ok_or(ResultsError::Unbound)
    }

    pub fn bound_assessment(&self) -> Result<Arc<Assessment>, ResultsError> {
        Ok(Arc::clone(&self.binding()?.assessment))
    }

    pub fn bound_collection(&self) -> Result<&Collection, ResultsError> {
        Ok(&self.binding()?.collection)
    }

    fn bound_params(b: &Binding) -> Vec<Value> {
        vec![text(&b.assessment.id), text(&b.collection_id)]
    }

    pub fn list_responses(&self) -> Result<Vec<UserMark>, ResultsError> {
        let b = self.binding()?;
        debug!(assessment_id = %b.assessment.id, "listing responses");
        let sql = format!(
            "SELECT um.group_id, um.user_id, um.marked_user_id, um.question_id, um.score
             FROM {} um
             INNER JOIN {} a ON um.assessment_id = a.assessment_id
             WHERE um.assessment_id = ?
               AND a.collection_id = ?
             ORDER BY um.group_id, um.user_id, um.marked_user_id, um.question_id",
            self.store.table("user_mark"),
            self.store.table("assessment")
        );
        let rows = self.store.fetch_all(&sql, &Self::bound_params(b))?;
        let mut out = Vec::with_capacity(rows.len());
        for r in &rows {
            out.push(UserMark {
                group_id: text_value(cell(r, 0, "group_id")?, "group_id")?,
                user_id: int_value(cell(r, 1, "user_id")?, "user_id")?,
                marked_user_id: int_value(cell(r, 2, "marked_user_id")?, "marked_user_id")?,
                question_id: int_value(cell(r, 3, "question_id")?, "question_id")?,
                score: int_value(cell(r, 4, "score")?, "score")?,
            });
        }
        Ok(out)
    }

    pub fn response_count(&self) -> Result<i64, ResultsError> {
        let b = self.binding()?;
        let sql = format!(
            "SELECT COUNT(DISTINCT um.user_id)
             FROM {} um
             INNER JOIN {} a ON um.assessment_id = a.assessment_id
             WHERE um.assessment_id = ?
               AND a.collection_id = ?",
            self.store.table("user_mark"),
            self.store.table("assessment")
        );
        let n = count_value(self.store.fetch_one(&sql, &Self::bound_params(b))?)?;
        debug!(assessment_id = %b.assessment.id, count = n, "response count");
        Ok(n)
    }

    pub fn responded_user_ids(&self) -> Result<Vec<i64>, ResultsError> {
        let b = self.binding()?;
        let sql = format!(
            "SELECT DISTINCT um.user_id
             FROM {} um
             INNER JOIN {} a ON um.assessment_id = a.assessment_id
             WHERE um.assessment_id = ?
               AND a.collection_id = ?
             ORDER BY um.user_id",
            self.store.table("user_mark"),
            self.store.table("assessment")
        );
        let values = self.store.fetch_first_column(&sql, &Self::bound_params(b))?;
        let ids = values
            .iter()
            .map(|v| int_value(v, "user_id"))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(ids)
    }

    /// `None` when the group is not part of the bound collection; `Some(0)`
    /// when it is and nobody in it has responded.
    pub fn response_count_for_group(&self, group_id: &str) -> Result<Option<i64>, ResultsError> {
        let b = self.binding()?;
        if !b.collection.group_id_exists(group_id) {
            debug!(assessment_id = %b.assessment.id, group_id, "group not in bound collection");
            return Ok(None);
        }
        let sql = format!(
            "SELECT COUNT(DISTINCT um.user_id)
             FROM {} um
             INNER JOIN {} a ON um.assessment_id = a.assessment_id
             WHERE um.assessment_id = ?
               AND a.collection_id = ?
               AND um.group_id = ?",
            self.store.table("user_mark"),
            self.store.table("assessment")
        );
        let mut params = Self::bound_params(b);
        params.push(text(group_id));
        let n = count_value(self.store.fetch_one(&sql, &params)?)?;
        Ok(Some(n))
    }

    /// Responded and eligible counts for every group of the bound collection,
    /// in collection order.
    pub fn group_response_counts(&self) -> Result<Vec<GroupResponseCount>, ResultsError> {
        let b = self.binding()?;
        let sql = format!(
            "SELECT um.group_id, COUNT(DISTINCT um.user_id)
             FROM {} um
             INNER JOIN {} a ON um.assessment_id = a.assessment_id
             WHERE um.assessment_id = ?
               AND a.collection_id = ?
             GROUP BY um.group_id",
            self.store.table("user_mark"),
            self.store.table("assessment")
        );
        let rows = self.store.fetch_all(&sql, &Self::bound_params(b))?;
        let mut by_group: HashMap<String, i64> = HashMap::new();
        for r in &rows {
            by_group.insert(
                text_value(cell(r, 0, "group_id")?, "group_id")?,
                int_value(cell(r, 1, "count")?, "count")?,
            );
        }
        Ok(b.collection
            .groups
            .iter()
            .map(|g| GroupResponseCount {
                group_id: g.id.clone(),
                group_name: g.name.clone(),
                responded: by_group.get(&g.id).copied().unwrap_or(0),
                members: g.members.len() as i64,
            })
            .collect())
    }

    /// Members of the bound collection with no submission yet, ascending.
    pub fn non_responders(&self) -> Result<Vec<i64>, ResultsError> {
        let responded: BTreeSet<i64> = self.responded_user_ids()?.into_iter().collect();
        let b = self.binding()?;
        Ok(b.collection
            .member_ids()
            .into_iter()
            .filter(|uid| !responded.contains(uid))
            .collect())
    }

    /// Distinct assessor counts for every assessment of the aggregator's module.
    /// `user_id` does not narrow the result; see [`ModuleScope`].
    pub fn response_counts_by_assessment_for_user(
        &self,
        user_id: i64,
        academic_year: Option<i32>,
    ) -> Result<BTreeMap<String, i64>, ResultsError> {
        self.binding()?;
        self.scope.response_counts(user_id, academic_year)
    }

    /// Distinct member counts for every assessment of the aggregator's module.
    pub fn member_counts_by_assessment_for_user(
        &self,
        user_id: i64,
        academic_year: Option<i32>,
    ) -> Result<BTreeMap<String, i64>, ResultsError> {
        self.binding()?;
        self.scope.member_counts(user_id, academic_year)
    }

    pub fn module_overview(
        &self,
        user_id: i64,
        academic_year: Option<i32>,
    ) -> Result<BTreeMap<String, AssessmentParticipation>, ResultsError> {
        self.binding()?;
        self.scope.overview(user_id, academic_year)
    }

    pub fn has_user_responded(&self, user_id: i64, assessment_id: &str) -> Result<bool, ResultsError> {
        self.binding()?;
        let sql = format!(
            "SELECT COUNT(um.user_id)
             FROM {} a
             LEFT JOIN {} um ON a.assessment_id = um.assessment_id
               AND um.user_id = ?
             WHERE a.assessment_id = ?",
            self.store.table("assessment"),
            self.store.table("user_mark")
        );
        let n = count_value(
            self.store
                .fetch_one(&sql, &[Value::Integer(user_id), text(assessment_id)])?,
        )?;
        Ok(n > 0)
    }
}
