use sqlparser::ast::{
    self, AssignmentTarget, BinaryOperator, Expr, FromTable, ObjectNamePart, SetExpr, Statement,
    TableFactor, TableObject, Value, ValueWithSpan,
};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use ulid::Ulid;

use crate::engine::BookingFilter;
use crate::limits::DEFAULT_PER_PAGE;
use crate::model::*;
use crate::notify::{BadRoom, Room};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VehicleChange {
    Price(Cents),
    Maintenance(bool),
}

/// Parsed command from SQL input.
#[derive(Debug, PartialEq)]
pub enum Command {
    InsertStation {
        id: Ulid,
        name: String,
        location: String,
    },
    DeleteStation {
        id: Ulid,
    },
    InsertUser {
        id: Ulid,
        name: String,
        role: Role,
    },
    UpdateUserRole {
        id: Ulid,
        role: Role,
    },
    DeactivateUser {
        id: Ulid,
    },
    InsertVehicle {
        id: Ulid,
        station_id: Ulid,
        model_name: String,
        price_per_hour: Cents,
        image_url: Option<String>,
    },
    UpdateVehicle {
        id: Ulid,
        change: VehicleChange,
    },
    DeleteVehicle {
        id: Ulid,
    },
    /// `DELETE FROM vehicles WHERE station_id = ...`
    RemoveUnmanagedVehicles {
        station_id: Ulid,
    },
    InsertBooking {
        id: Ulid,
        /// Defaults to the connected user.
        user_id: Option<Ulid>,
        vehicle_id: Ulid,
        station_id: Option<Ulid>,
        start: Ms,
        end: Ms,
        emergency_contacts: Vec<String>,
    },
    UpdateBookingStatus {
        id: Ulid,
        status: BookingStatus,
        expected_version: Option<u64>,
    },
    ModifyBooking {
        id: Ulid,
        new_end: Ms,
        kind: ModificationKind,
    },
    RecordPayment {
        id: Ulid,
        status: PaymentStatus,
        payment_id: Option<String>,
    },
    SelectBookings {
        filter: BookingFilter,
    },
    SelectBookedSlots {
        vehicle_id: Ulid,
        window: Option<(Ms, Ms)>,
    },
    SelectAvailability {
        vehicle_id: Ulid,
        start: Ms,
        end: Ms,
        min_duration: Option<Ms>,
    },
    SelectVehicles {
        station_id: Option<Ulid>,
        window: Option<(Ms, Ms)>,
    },
    SelectStations,
    SelectUsers,
    SelectDashboard {
        station_id: Ulid,
    },
    SelectActiveRides,
    SelectNotifications {
        /// Defaults to the connected user.
        user_id: Option<Ulid>,
        page: usize,
        per_page: usize,
    },
    /// One record by id, or every record of a user.
    MarkNotificationsRead {
        id: Option<Ulid>,
        user_id: Option<Ulid>,
    },
    Listen {
        room: Room,
    },
    Unlisten {
        room: Room,
    },
    UnlistenAll,
}

pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    let trimmed = sql.trim().trim_end_matches(';').trim();
    let upper = trimmed.to_uppercase();
    if upper.starts_with("LISTEN ") {
        let room = trimmed[7..].trim().parse()?;
        return Ok(Command::Listen { room });
    }
    if upper.starts_with("UNLISTEN ") {
        let channel = trimmed[9..].trim();
        if channel == "*" {
            return Ok(Command::UnlistenAll);
        }
        return Ok(Command::Unlisten {
            room: channel.parse()?,
        });
    }

    let dialect = PostgreSqlDialect {};
    let stmts = Parser::parse_sql(&dialect, sql).map_err(|e| SqlError::Parse(e.to_string()))?;
    if stmts.is_empty() {
        return Err(SqlError::Empty);
    }

    match &stmts[0] {
        Statement::Insert(insert) => parse_insert(insert),
        Statement::Update {
            table,
            assignments,
            selection,
            ..
        } => parse_update(table, assignments, selection),
        Statement::Delete(delete) => parse_delete(delete),
        Statement::Query(query) => parse_select(query),
        other => Err(SqlError::Unsupported(format!("{other}"))),
    }
}

// ── Column bags ───────────────────────────────────────────────

/// Named values from an INSERT row or an UPDATE SET list.
struct Row {
    table: &'static str,
    cols: Vec<(String, Expr)>,
}

impl Row {
    fn get(&self, col: &str) -> Option<&Expr> {
        self.cols.iter().find(|(c, _)| c == col).map(|(_, e)| e)
    }

    fn has(&self, col: &str) -> bool {
        self.get(col).is_some()
    }

    fn require(&self, col: &'static str) -> Result<&Expr, SqlError> {
        self.get(col).ok_or(SqlError::MissingColumn(self.table, col))
    }

    fn ulid(&self, col: &'static str) -> Result<Ulid, SqlError> {
        parse_ulid_expr(self.require(col)?)
    }

    fn opt_ulid(&self, col: &str) -> Result<Option<Ulid>, SqlError> {
        self.get(col).map_or(Ok(None), parse_ulid_or_null)
    }

    fn string(&self, col: &'static str) -> Result<String, SqlError> {
        parse_string_expr(self.require(col)?)
    }

    fn opt_string(&self, col: &str) -> Result<Option<String>, SqlError> {
        self.get(col).map_or(Ok(None), parse_string_or_null)
    }

    fn i64(&self, col: &'static str) -> Result<i64, SqlError> {
        parse_i64_expr(self.require(col)?)
    }

    fn parsed<T: std::str::FromStr<Err = UnknownVariant>>(&self, col: &'static str) -> Result<T, SqlError> {
        Ok(self.string(col)?.parse()?)
    }
}

/// Positional column order when an INSERT omits its column list.
fn default_columns(table: &str) -> Option<(&'static str, &'static [&'static str])> {
    Some(match table {
        "stations" => ("stations", &["id", "name", "location"]),
        "users" => ("users", &["id", "name", "role", "station_id"]),
        "vehicles" => (
            "vehicles",
            &["id", "station_id", "model_name", "price_per_hour", "image_url"],
        ),
        "bookings" => (
            "bookings",
            &["id", "vehicle_id", "start", "end", "station_id", "emergency_contacts", "user_id"],
        ),
        _ => return None,
    })
}

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;
    let (table_name, defaults) =
        default_columns(&table).ok_or_else(|| SqlError::UnknownTable(table.clone()))?;
    let rows = extract_all_insert_rows(insert)?;
    if rows.len() != 1 {
        return Err(SqlError::Unsupported("multi-row INSERT".into()));
    }
    let values = &rows[0];

    let names: Vec<String> = if insert.columns.is_empty() {
        if values.len() > defaults.len() {
            return Err(SqlError::WrongArity(table_name, defaults.len(), values.len()));
        }
        defaults.iter().map(|c| c.to_string()).collect()
    } else {
        if insert.columns.len() != values.len() {
            return Err(SqlError::WrongArity(table_name, insert.columns.len(), values.len()));
        }
        insert.columns.iter().map(|i| i.value.to_lowercase()).collect()
    };
    let row = Row {
        table: table_name,
        cols: names.into_iter().zip(values.iter().cloned()).collect(),
    };

    match table_name {
        "stations" => Ok(Command::InsertStation {
            id: row.ulid("id")?,
            name: row.string("name")?,
            location: row.opt_string("location")?.unwrap_or_default(),
        }),
        "users" => Ok(Command::InsertUser {
            id: row.ulid("id")?,
            name: row.string("name")?,
            role: role_from(&row.string("role")?, row.opt_ulid("station_id")?)?,
        }),
        "vehicles" => Ok(Command::InsertVehicle {
            id: row.ulid("id")?,
            station_id: row.ulid("station_id")?,
            model_name: row.string("model_name")?,
            price_per_hour: row.i64("price_per_hour")?,
            image_url: row.opt_string("image_url")?,
        }),
        _ => Ok(Command::InsertBooking {
            id: row.ulid("id")?,
            user_id: row.opt_ulid("user_id")?,
            vehicle_id: row.ulid("vehicle_id")?,
            station_id: row.opt_ulid("station_id")?,
            start: row.i64("start")?,
            end: row.i64("end")?,
            emergency_contacts: match row.get("emergency_contacts") {
                Some(e) => parse_string_list(e)?,
                None => Vec::new(),
            },
        }),
    }
}

fn role_from(label: &str, station_id: Option<Ulid>) -> Result<Role, SqlError> {
    match label.trim().to_ascii_lowercase().as_str() {
        "customer" => Ok(Role::Customer),
        "super-admin" => Ok(Role::SuperAdmin),
        "station-master" => station_id
            .map(|station_id| Role::StationMaster { station_id })
            .ok_or(SqlError::MissingColumn("users", "station_id")),
        other => Err(SqlError::Parse(format!("unknown role: {other}"))),
    }
}

fn parse_update(
    table: &ast::TableWithJoins,
    assignments: &[ast::Assignment],
    selection: &Option<Expr>,
) -> Result<Command, SqlError> {
    let table = table_factor_name(&table.relation)?;
    let mut cols = Vec::with_capacity(assignments.len());
    for a in assignments {
        let name = match &a.target {
            AssignmentTarget::ColumnName(name) => object_name_last(name),
            AssignmentTarget::Tuple(_) => None,
        }
        .ok_or_else(|| SqlError::Unsupported("tuple assignment".into()))?;
        cols.push((name, a.value.clone()));
    }
    let filters = Filters::from_selection(selection)?;

    match table.as_str() {
        "users" => {
            let set = Row { table: "users", cols };
            let id = filters.require_ulid("id")?;
            if set.has("role") {
                let role = role_from(&set.string("role")?, set.opt_ulid("station_id")?)?;
                return Ok(Command::UpdateUserRole { id, role });
            }
            if let Some(active) = set.get("active") {
                if parse_bool(active)? {
                    return Err(SqlError::Unsupported("reactivating users".into()));
                }
                return Ok(Command::DeactivateUser { id });
            }
            Err(SqlError::MissingColumn("users", "role"))
        }
        "vehicles" => {
            let set = Row { table: "vehicles", cols };
            let id = filters.require_ulid("id")?;
            let change = if set.has("price_per_hour") {
                VehicleChange::Price(set.i64("price_per_hour")?)
            } else if let Some(m) = set.get("maintenance") {
                VehicleChange::Maintenance(parse_bool(m)?)
            } else {
                return Err(SqlError::MissingColumn("vehicles", "price_per_hour"));
            };
            Ok(Command::UpdateVehicle { id, change })
        }
        "bookings" => {
            let set = Row { table: "bookings", cols };
            let id = filters.require_ulid("id")?;
            if set.has("status") {
                let expected_version = match filters.i64_eq("version")? {
                    Some(v) => Some(
                        u64::try_from(v).map_err(|_| SqlError::Parse(format!("bad version: {v}")))?,
                    ),
                    None => None,
                };
                return Ok(Command::UpdateBookingStatus {
                    id,
                    status: set.parsed("status")?,
                    expected_version,
                });
            }
            if set.has("end") {
                return Ok(Command::ModifyBooking {
                    id,
                    new_end: set.i64("end")?,
                    kind: set.parsed("modification_type")?,
                });
            }
            if set.has("payment_status") {
                return Ok(Command::RecordPayment {
                    id,
                    status: set.parsed("payment_status")?,
                    payment_id: set.opt_string("payment_id")?,
                });
            }
            Err(SqlError::MissingColumn("bookings", "status"))
        }
        "notifications" => {
            let set = Row { table: "notifications", cols };
            if !parse_bool(set.require("read")?)? {
                return Err(SqlError::Unsupported("marking notifications unread".into()));
            }
            Ok(Command::MarkNotificationsRead {
                id: filters.ulid_eq("id")?,
                user_id: filters.ulid_eq("user_id")?,
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table = delete_table_name(delete)?;
    let filters = Filters::from_selection(&delete.selection)?;

    match table.as_str() {
        "stations" => Ok(Command::DeleteStation {
            id: filters.require_ulid("id")?,
        }),
        "users" => Ok(Command::DeactivateUser {
            id: filters.require_ulid("id")?,
        }),
        "vehicles" => match filters.ulid_eq("id")? {
            Some(id) => Ok(Command::DeleteVehicle { id }),
            None => Ok(Command::RemoveUnmanagedVehicles {
                station_id: filters.require_ulid("station_id")?,
            }),
        },
        "bookings" => Err(SqlError::Unsupported(
            "bookings are cancelled, not deleted".into(),
        )),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn parse_select(query: &ast::Query) -> Result<Command, SqlError> {
    let select = match query.body.as_ref() {
        SetExpr::Select(s) => s,
        _ => return Err(SqlError::Unsupported("non-SELECT query".into())),
    };

    if select.from.is_empty() {
        return Err(SqlError::Parse("SELECT without FROM".into()));
    }
    let table = table_factor_name(&select.from[0].relation)?;
    let f = Filters::from_selection(&select.selection)?;

    match table.as_str() {
        "bookings" => Ok(Command::SelectBookings {
            filter: BookingFilter {
                id: f.ulid_eq("id")?,
                user_id: f.ulid_eq("user_id")?,
                station_id: f.ulid_eq("station_id")?,
                vehicle_id: f.ulid_eq("vehicle_id")?,
                status: f.str_eq("status")?.map(|s| s.parse()).transpose()?,
            },
        }),
        "booked_slots" => Ok(Command::SelectBookedSlots {
            vehicle_id: f.require_ulid("vehicle_id")?,
            window: f.window()?,
        }),
        "availability" => Ok(Command::SelectAvailability {
            vehicle_id: f.require_ulid("vehicle_id")?,
            start: f.i64_cmp("start", BinaryOperator::GtEq)?.ok_or(SqlError::MissingFilter("start"))?,
            end: f.i64_cmp("end", BinaryOperator::LtEq)?.ok_or(SqlError::MissingFilter("end"))?,
            min_duration: f.i64_eq("min_duration")?,
        }),
        "vehicles" => Ok(Command::SelectVehicles {
            station_id: f.ulid_eq("station_id")?,
            window: f.window()?,
        }),
        "stations" => Ok(Command::SelectStations),
        "users" => Ok(Command::SelectUsers),
        "dashboard" => Ok(Command::SelectDashboard {
            station_id: f.require_ulid("station_id")?,
        }),
        "active_rides" => Ok(Command::SelectActiveRides),
        "notifications" => Ok(Command::SelectNotifications {
            user_id: f.ulid_eq("user_id")?,
            page: f.usize_eq("page")?.unwrap_or(1),
            per_page: f.usize_eq("per_page")?.unwrap_or(DEFAULT_PER_PAGE),
        }),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

// ── WHERE clauses ─────────────────────────────────────────────

/// Flattened `col <op> value AND ...` predicates.
struct Filters {
    preds: Vec<(String, BinaryOperator, Expr)>,
}

impl Filters {
    fn from_selection(selection: &Option<Expr>) -> Result<Self, SqlError> {
        let mut preds = Vec::new();
        if let Some(expr) = selection {
            collect_predicates(expr, &mut preds)?;
        }
        Ok(Self { preds })
    }

    fn find(&self, col: &str, op: BinaryOperator) -> Option<&Expr> {
        self.preds
            .iter()
            .find(|(c, o, _)| c == col && *o == op)
            .map(|(_, _, e)| e)
    }

    fn ulid_eq(&self, col: &str) -> Result<Option<Ulid>, SqlError> {
        self.find(col, BinaryOperator::Eq).map(parse_ulid_expr).transpose()
    }

    fn require_ulid(&self, col: &'static str) -> Result<Ulid, SqlError> {
        self.ulid_eq(col)?.ok_or(SqlError::MissingFilter(col))
    }

    fn str_eq(&self, col: &str) -> Result<Option<String>, SqlError> {
        self.find(col, BinaryOperator::Eq).map(parse_string_expr).transpose()
    }

    fn i64_eq(&self, col: &str) -> Result<Option<i64>, SqlError> {
        self.i64_cmp(col, BinaryOperator::Eq)
    }

    fn i64_cmp(&self, col: &str, op: BinaryOperator) -> Result<Option<i64>, SqlError> {
        self.find(col, op).map(parse_i64_expr).transpose()
    }

    fn usize_eq(&self, col: &str) -> Result<Option<usize>, SqlError> {
        match self.i64_eq(col)? {
            Some(v) => usize::try_from(v)
                .map(Some)
                .map_err(|_| SqlError::Parse(format!("{col} must not be negative"))),
            None => Ok(None),
        }
    }

    /// `start >= a AND "end" <= b`; both or neither.
    fn window(&self) -> Result<Option<(Ms, Ms)>, SqlError> {
        let start = self.i64_cmp("start", BinaryOperator::GtEq)?;
        let end = self.i64_cmp("end", BinaryOperator::LtEq)?;
        match (start, end) {
            (Some(s), Some(e)) => Ok(Some((s, e))),
            (None, None) => Ok(None),
            (None, Some(_)) => Err(SqlError::MissingFilter("start")),
            (Some(_), None) => Err(SqlError::MissingFilter("end")),
        }
    }
}

fn collect_predicates(
    expr: &Expr,
    out: &mut Vec<(String, BinaryOperator, Expr)>,
) -> Result<(), SqlError> {
    match expr {
        Expr::Nested(inner) => collect_predicates(inner, out),
        Expr::BinaryOp { left, op, right } => match op {
            BinaryOperator::And => {
                collect_predicates(left, out)?;
                collect_predicates(right, out)
            }
            BinaryOperator::Eq | BinaryOperator::GtEq | BinaryOperator::LtEq => {
                let col = expr_column_name(left)
                    .ok_or_else(|| SqlError::Unsupported(format!("predicate {expr}")))?;
                out.push((col, op.clone(), (**right).clone()));
                Ok(())
            }
            _ => Err(SqlError::Unsupported(format!("operator {op}"))),
        },
        _ => Err(SqlError::Unsupported(format!("predicate {expr}"))),
    }
}

// ── Helpers ───────────────────────────────────────────────────

fn object_name_last(name: &ast::ObjectName) -> Option<String> {
    name.0.last().and_then(|part| match part {
        ObjectNamePart::Identifier(ident) => Some(ident.value.to_lowercase()),
        _ => None,
    })
}

fn insert_table_name(insert: &ast::Insert) -> Result<String, SqlError> {
    match &insert.table {
        TableObject::TableName(name) => {
            object_name_last(name).ok_or_else(|| SqlError::Parse("empty table name".into()))
        }
        _ => Err(SqlError::Parse("unsupported table object in INSERT".into())),
    }
}

fn delete_table_name(delete: &ast::Delete) -> Result<String, SqlError> {
    let tables_with_joins = match &delete.from {
        FromTable::WithFromKeyword(t) | FromTable::WithoutKeyword(t) => t,
    };
    if let Some(first) = tables_with_joins.first() {
        table_factor_name(&first.relation)
    } else {
        Err(SqlError::Parse("DELETE without table".into()))
    }
}

fn table_factor_name(tf: &TableFactor) -> Result<String, SqlError> {
    match tf {
        TableFactor::Table { name, .. } => {
            object_name_last(name).ok_or_else(|| SqlError::Parse("empty table name".into()))
        }
        _ => Err(SqlError::Parse("complex table expression".into())),
    }
}

fn extract_all_insert_rows(insert: &ast::Insert) -> Result<Vec<Vec<Expr>>, SqlError> {
    let body = insert
        .source
        .as_ref()
        .ok_or(SqlError::Parse("no VALUES".into()))?;
    match body.body.as_ref() {
        SetExpr::Values(values) => {
            if values.rows.is_empty() {
                return Err(SqlError::Parse("empty VALUES".into()));
            }
            Ok(values.rows.clone())
        }
        _ => Err(SqlError::Parse("expected VALUES".into())),
    }
}

fn expr_column_name(expr: &Expr) -> Option<String> {
    match expr {
        Expr::Identifier(ident) => Some(ident.value.to_lowercase()),
        Expr::CompoundIdentifier(parts) => parts.last().map(|i| i.value.to_lowercase()),
        _ => None,
    }
}

fn extract_value(expr: &Expr) -> Option<&Value> {
    match expr {
        Expr::Value(ValueWithSpan { value, .. }) => Some(value),
        _ => None,
    }
}

fn parse_ulid_expr(expr: &Expr) -> Result<Ulid, SqlError> {
    if let Some(value) = extract_value(expr) {
        match value {
            Value::SingleQuotedString(s) | Value::Number(s, _) => {
                Ulid::from_string(s).map_err(|e| SqlError::Parse(format!("bad ULID: {e}")))
            }
            _ => Err(SqlError::Parse(format!("expected string, got {value:?}"))),
        }
    } else {
        Err(SqlError::Parse(format!("expected value, got {expr:?}")))
    }
}

fn parse_ulid_or_null(expr: &Expr) -> Result<Option<Ulid>, SqlError> {
    match extract_value(expr) {
        Some(Value::Null) => Ok(None),
        _ => parse_ulid_expr(expr).map(Some),
    }
}

fn parse_string_expr(expr: &Expr) -> Result<String, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s)) => Ok(s.clone()),
        Some(other) => Err(SqlError::Parse(format!("expected string, got {other:?}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr:?}"))),
    }
}

fn parse_string_or_null(expr: &Expr) -> Result<Option<String>, SqlError> {
    match extract_value(expr) {
        Some(Value::Null) => Ok(None),
        _ => parse_string_expr(expr).map(Some),
    }
}

/// `ARRAY['a', 'b']`, a single string, or NULL.
fn parse_string_list(expr: &Expr) -> Result<Vec<String>, SqlError> {
    match expr {
        Expr::Array(array) => array.elem.iter().map(parse_string_expr).collect(),
        _ => Ok(parse_string_or_null(expr)?.into_iter().collect()),
    }
}

fn parse_i64_expr(expr: &Expr) -> Result<i64, SqlError> {
    if let Some(value) = extract_value(expr) {
        match value {
            Value::Number(s, _) => s
                .parse()
                .map_err(|e| SqlError::Parse(format!("bad i64: {e}"))),
            Value::SingleQuotedString(s) => s
                .parse()
                .map_err(|e| SqlError::Parse(format!("bad i64: {e}"))),
            _ => Err(SqlError::Parse(format!("expected number, got {value:?}"))),
        }
    } else if let Expr::UnaryOp {
        op: ast::UnaryOperator::Minus,
        expr,
    } = expr
    {
        Ok(-parse_i64_expr(expr)?)
    } else {
        Err(SqlError::Parse(format!("expected value, got {expr:?}")))
    }
}

fn parse_bool(expr: &Expr) -> Result<bool, SqlError> {
    if let Some(value) = extract_value(expr) {
        match value {
            Value::Boolean(b) => Ok(*b),
            Value::SingleQuotedString(s) => match s.to_lowercase().as_str() {
                "true" | "t" | "1" => Ok(true),
                "false" | "f" | "0" => Ok(false),
                _ => Err(SqlError::Parse(format!("bad bool: {s}"))),
            },
            Value::Number(n, _) => Ok(n != "0"),
            _ => Err(SqlError::Parse(format!("expected bool, got {value:?}"))),
        }
    } else {
        Err(SqlError::Parse(format!("expected value, got {expr:?}")))
    }
}

// ── Errors ────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum SqlError {
    #[error("parse error: {0}")]
    Parse(String),
    #[error("empty query")]
    Empty,
    #[error("unsupported: {0}")]
    Unsupported(String),
    #[error("unknown table: {0}")]
    UnknownTable(String),
    #[error("{0}: expected {1} values, got {2}")]
    WrongArity(&'static str, usize, usize),
    #[error("{0}: missing column {1}")]
    MissingColumn(&'static str, &'static str),
    #[error("missing filter: {0}")]
    MissingFilter(&'static str),
    #[error(transparent)]
    BadValue(#[from] UnknownVariant),
    #[error(transparent)]
    BadChannel(#[from] BadRoom),
}
