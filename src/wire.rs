use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use async_trait::async_trait;
use futures::{Sink, SinkExt, stream};
use pgwire::api::auth::cleartext::CleartextPasswordAuthStartupHandler;
use pgwire::api::auth::{DefaultServerParameterProvider, StartupHandler};
use pgwire::api::copy::CopyHandler;
use pgwire::api::portal::{Format, Portal};
use pgwire::api::query::{ExtendedQueryHandler, SimpleQueryHandler};
use pgwire::api::results::{
    DataRowEncoder, DescribePortalResponse, DescribeStatementResponse, FieldFormat, FieldInfo,
    QueryResponse, Response, Tag,
};
use pgwire::api::stmt::{QueryParser, StoredStatement};
use pgwire::api::store::PortalStore;
use pgwire::api::{ClientInfo, ClientPortalStore, NoopHandler, PgWireServerHandlers, Type};
use pgwire::error::{ErrorInfo, PgWireError, PgWireResult};
use pgwire::messages::PgWireBackendMessage;
use pgwire::messages::response::NotificationResponse;
use pgwire::tokio::{TlsAcceptor, process_socket};
use tokio::net::TcpStream;
use tokio::sync::broadcast::{self, error::TryRecvError};
use ulid::Ulid;

use crate::auth::FleetAuthSource;
use crate::authz::{self, Actor, AuthzError};
use crate::engine::{EngineError, NewBooking, Trigger};
use crate::model::*;
use crate::notify::{NotifyHub, PushMessage, Room};
use crate::observability;
use crate::sql::{self, Command, SqlError, VehicleChange};
use crate::tenant::{Tenant, TenantManager};

/// Backend ids reported in NotificationResponse. Unique per process.
static NEXT_PID: AtomicI32 = AtomicI32::new(1);

#[derive(Debug, thiserror::Error)]
enum CommandError {
    #[error(transparent)]
    Sql(#[from] SqlError),
    #[error(transparent)]
    Engine(#[from] EngineError),
    #[error(transparent)]
    Authz(#[from] AuthzError),
    #[error("tenant error: {0}")]
    Tenant(std::io::Error),
}

impl CommandError {
    fn sqlstate(&self) -> &'static str {
        match self {
            CommandError::Sql(_) => "42601",
            CommandError::Engine(e) => e.sqlstate(),
            CommandError::Authz(e) => e.sqlstate(),
            CommandError::Tenant(_) => "08006",
        }
    }
}

impl From<CommandError> for PgWireError {
    fn from(e: CommandError) -> Self {
        PgWireError::UserError(Box::new(ErrorInfo::new(
            "ERROR".into(),
            e.sqlstate().into(),
            e.to_string(),
        )))
    }
}

/// Rooms this connection has LISTENed on, with the hub they belong to.
#[derive(Default)]
struct Listening {
    hub: Option<Arc<NotifyHub>>,
    rooms: HashMap<Room, broadcast::Receiver<PushMessage>>,
}

/// One handler per connection, so LISTEN state lives here.
pub struct FleetHandler {
    tenants: Arc<TenantManager>,
    operator: String,
    pid: i32,
    query_parser: Arc<FleetQueryParser>,
    listening: Mutex<Listening>,
}

impl FleetHandler {
    pub fn new(tenants: Arc<TenantManager>, operator: String) -> Self {
        Self {
            tenants,
            operator,
            pid: NEXT_PID.fetch_add(1, Ordering::Relaxed),
            query_parser: Arc::new(FleetQueryParser),
            listening: Mutex::new(Listening::default()),
        }
    }

    /// Tenant from the database name, actor from the login name. The actor
    /// is looked up on every query so role changes and deactivation apply
    /// to open connections.
    fn session<C: ClientInfo>(&self, client: &C) -> Result<(Tenant, Actor), CommandError> {
        let meta = client.metadata();
        let db = meta.get("database").map(String::as_str).unwrap_or("default");
        let tenant = self.tenants.get_or_create(db).map_err(CommandError::Tenant)?;
        let login = meta.get("user").map(String::as_str).unwrap_or_default();
        let actor = authz::resolve_actor(&tenant.engine, login, &self.operator)?;
        Ok((tenant, actor))
    }

    async fn run(&self, tenant: &Tenant, actor: &Actor, query: &str) -> Result<Response, CommandError> {
        let cmd = sql::parse_sql(query)?;
        let label = observability::command_label(&cmd);
        let started = Instant::now();
        let result = self.execute_command(tenant, actor, cmd).await;
        metrics::histogram!(observability::QUERY_DURATION_SECONDS, "command" => label)
            .record(started.elapsed().as_secs_f64());
        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(observability::QUERIES_TOTAL, "command" => label, "status" => status)
            .increment(1);
        if let Err(e) = &result {
            tracing::debug!(command = label, error = %e, "query failed");
        }
        result
    }

    async fn execute_command(
        &self,
        tenant: &Tenant,
        actor: &Actor,
        cmd: Command,
    ) -> Result<Response, CommandError> {
        let engine = &tenant.engine;
        let response = match cmd {
            // ── Directory ───────────────────────────────────────
            Command::InsertStation { id, name, location } => {
                actor.require_admin()?;
                engine.create_station(id, name, location).await?;
                exec("INSERT", 1)
            }
            Command::DeleteStation { id } => {
                actor.require_admin()?;
                engine.delete_station(id).await?;
                exec("DELETE", 1)
            }
            Command::InsertUser { id, name, role } => {
                actor.require_admin()?;
                engine.register_user(id, name, role).await?;
                exec("INSERT", 1)
            }
            Command::UpdateUserRole { id, role } => {
                actor.require_admin()?;
                engine.change_role(id, role).await?;
                exec("UPDATE", 1)
            }
            Command::DeactivateUser { id } => {
                actor.require_admin()?;
                engine.deactivate_user(id).await?;
                exec("UPDATE", 1)
            }
            Command::InsertVehicle {
                id,
                station_id,
                model_name,
                price_per_hour,
                image_url,
            } => {
                actor.require_staff_of(station_id)?;
                engine
                    .create_vehicle(id, station_id, model_name, price_per_hour, image_url)
                    .await?;
                exec("INSERT", 1)
            }
            Command::UpdateVehicle { id, change } => {
                let vehicle = engine.get_vehicle(id).await.ok_or(EngineError::NotFound(id))?;
                actor.require_staff_of(vehicle.station_id)?;
                match change {
                    VehicleChange::Price(price) => engine.update_vehicle_price(id, price).await?,
                    VehicleChange::Maintenance(on) => engine.set_maintenance(id, on).await?,
                };
                exec("UPDATE", 1)
            }
            Command::DeleteVehicle { id } => {
                let vehicle = engine.get_vehicle(id).await.ok_or(EngineError::NotFound(id))?;
                actor.require_staff_of(vehicle.station_id)?;
                engine.delete_vehicle(id).await?;
                exec("DELETE", 1)
            }
            Command::RemoveUnmanagedVehicles { station_id } => {
                actor.require_admin()?;
                let removed = engine.remove_unmanaged_vehicles(station_id).await?;
                exec("DELETE", removed.len())
            }

            // ── Bookings ────────────────────────────────────────
            Command::InsertBooking {
                id,
                user_id,
                vehicle_id,
                station_id,
                start,
                end,
                emergency_contacts,
            } => {
                let user_id = actor.subject(user_id)?;
                engine
                    .create_booking(NewBooking {
                        id,
                        user_id,
                        vehicle_id,
                        station_id,
                        start,
                        end,
                        emergency_contacts,
                    })
                    .await?;
                exec("INSERT", 1)
            }
            Command::UpdateBookingStatus {
                id,
                status,
                expected_version,
            } => {
                let booking = engine.get_booking(id).await.ok_or(EngineError::NotFound(id))?;
                actor.require_staff_of(booking.station_id)?;
                let trigger = if actor.is_admin()
                    && status == BookingStatus::Cancelled
                    && matches!(booking.status, BookingStatus::Confirmed | BookingStatus::Active)
                {
                    Trigger::AdminOverride
                } else {
                    Trigger::Staff
                };
                engine.transition(id, status, trigger, expected_version).await?;
                exec("UPDATE", 1)
            }
            Command::ModifyBooking { id, new_end, kind } => {
                let booking = engine.get_booking(id).await.ok_or(EngineError::NotFound(id))?;
                actor.require_booking_access(&booking)?;
                engine.modify_booking(id, new_end, kind).await?;
                exec("UPDATE", 1)
            }
            Command::RecordPayment {
                id,
                status,
                payment_id,
            } => {
                actor.require_admin()?;
                engine.record_payment(id, status, payment_id).await?;
                exec("UPDATE", 1)
            }

            // ── Reads ───────────────────────────────────────────
            Command::SelectBookings { filter } => {
                let filter = actor.scope_bookings(filter)?;
                let bookings = engine.find_bookings(&filter).await;
                rows(booking_schema(), bookings, encode_booking)
            }
            Command::SelectActiveRides => {
                actor.require_admin()?;
                let rides = engine.active_rides().await;
                rows(booking_schema(), rides, encode_booking)
            }
            Command::SelectBookedSlots { vehicle_id, window } => {
                let slots = engine.booked_slots(vehicle_id, window).await?;
                rows(slot_schema(), slots, |e, s| {
                    e.encode_field(&s.booking_id.to_string())?;
                    e.encode_field(&s.start)?;
                    e.encode_field(&s.end)?;
                    e.encode_field(&s.status.to_string())
                })
            }
            Command::SelectAvailability {
                vehicle_id,
                start,
                end,
                min_duration,
            } => {
                let free = engine.free_windows(vehicle_id, start, end, min_duration).await?;
                let vid = vehicle_id.to_string();
                rows(availability_schema(), free, |e, span| {
                    e.encode_field(&vid)?;
                    e.encode_field(&span.start)?;
                    e.encode_field(&span.end)
                })
            }
            Command::SelectVehicles { station_id, window } => {
                let vehicles = engine.search_vehicles(station_id, window).await?;
                rows(vehicle_schema(), vehicles, |e, v| {
                    e.encode_field(&v.id.to_string())?;
                    e.encode_field(&v.station_id.to_string())?;
                    e.encode_field(&v.model_name)?;
                    e.encode_field(&v.image_url)?;
                    e.encode_field(&v.price_per_hour)?;
                    e.encode_field(&v.status.to_string())?;
                    e.encode_field(&v.available_after)
                })
            }
            Command::SelectStations => {
                let stations = engine.list_stations();
                rows(station_schema(), stations, |e, s| {
                    e.encode_field(&s.id.to_string())?;
                    e.encode_field(&s.name)?;
                    e.encode_field(&s.location)?;
                    e.encode_field(&s.created_at)
                })
            }
            Command::SelectUsers => {
                actor.require_admin()?;
                let users = engine.list_users();
                rows(user_schema(), users, |e, u| {
                    e.encode_field(&u.id.to_string())?;
                    e.encode_field(&u.name)?;
                    e.encode_field(&u.role.label().to_string())?;
                    e.encode_field(&u.role.station_id().map(|s| s.to_string()))?;
                    e.encode_field(&u.active)?;
                    e.encode_field(&u.created_at)
                })
            }
            Command::SelectDashboard { station_id } => {
                actor.require_staff_of(station_id)?;
                let dash = engine.dashboard(station_id).await?;
                rows(dashboard_schema(), vec![dash], |e, d| {
                    e.encode_field(&d.station_id.to_string())?;
                    e.encode_field(&(d.total_vehicles as i64))?;
                    e.encode_field(&(d.available as i64))?;
                    e.encode_field(&(d.reserved as i64))?;
                    e.encode_field(&(d.in_use as i64))?;
                    e.encode_field(&(d.maintenance as i64))?;
                    e.encode_field(&(d.pending as i64))?;
                    e.encode_field(&(d.confirmed as i64))?;
                    e.encode_field(&(d.active as i64))?;
                    let overdue: Vec<String> = d.overdue.iter().map(Ulid::to_string).collect();
                    e.encode_field(&json_text(&overdue))
                })
            }

            // ── Inbox ───────────────────────────────────────────
            Command::SelectNotifications {
                user_id,
                page,
                per_page,
            } => {
                let user_id = actor.subject(user_id)?;
                let inbox = engine.list_notifications(user_id, page, per_page);
                let (total, unread) = (inbox.total as i64, inbox.unread as i64);
                rows(notification_schema(), inbox.items, |e, n| {
                    e.encode_field(&n.id.to_string())?;
                    e.encode_field(&n.user_id.to_string())?;
                    e.encode_field(&n.title)?;
                    e.encode_field(&n.message)?;
                    e.encode_field(&n.kind.to_string())?;
                    e.encode_field(&n.priority.to_string())?;
                    e.encode_field(&json_text(&n.channels))?;
                    e.encode_field(&n.read)?;
                    e.encode_field(&n.created_at)?;
                    e.encode_field(&n.expires_at)?;
                    e.encode_field(&total)?;
                    e.encode_field(&unread)
                })
            }
            Command::MarkNotificationsRead { id, user_id } => {
                let user_id = actor.subject(user_id)?;
                let flipped = match id {
                    Some(id) => {
                        engine.mark_notification_read(user_id, id).await?;
                        1
                    }
                    None => engine.mark_all_notifications_read(user_id).await?,
                };
                exec("UPDATE", flipped)
            }

            // ── Event channel ───────────────────────────────────
            Command::Listen { room } => {
                actor.may_listen(room)?;
                self.listen(&tenant.hub, room);
                Response::Execution(Tag::new("LISTEN"))
            }
            Command::Unlisten { room } => {
                self.unlisten(Some(room));
                Response::Execution(Tag::new("UNLISTEN"))
            }
            Command::UnlistenAll => {
                self.unlisten(None);
                Response::Execution(Tag::new("UNLISTEN"))
            }
        };
        Ok(response)
    }

    fn listen(&self, hub: &Arc<NotifyHub>, room: Room) {
        let mut listening = self.listening.lock().unwrap_or_else(|e| e.into_inner());
        listening.hub.get_or_insert_with(|| hub.clone());
        listening.rooms.entry(room).or_insert_with(|| hub.subscribe(room));
        tracing::debug!(pid = self.pid, %room, "listening");
    }

    fn unlisten(&self, room: Option<Room>) {
        let mut listening = self.listening.lock().unwrap_or_else(|e| e.into_inner());
        match room {
            Some(room) => {
                listening.rooms.remove(&room);
            }
            None => listening.rooms.clear(),
        }
        if let Some(hub) = &listening.hub {
            hub.prune();
        }
    }

    /// Drain everything buffered on this connection's rooms.
    fn take_pending(&self) -> Vec<(Room, PushMessage)> {
        let mut out = Vec::new();
        let mut listening = self.listening.lock().unwrap_or_else(|e| e.into_inner());
        let pid = self.pid;
        listening.rooms.retain(|room, rx| {
            loop {
                match rx.try_recv() {
                    Ok(msg) => out.push((*room, msg)),
                    Err(TryRecvError::Empty) => break true,
                    Err(TryRecvError::Lagged(skipped)) => {
                        tracing::warn!(pid, %room, skipped, "listener lagged, messages dropped");
                    }
                    Err(TryRecvError::Closed) => break false,
                }
            }
        });
        out
    }

    /// Send buffered room messages as NotificationResponse. Runs at the
    /// start of every query; pgwire drives the socket between queries.
    async fn forward_notifications<C>(&self, client: &mut C) -> PgWireResult<()>
    where
        C: Sink<PgWireBackendMessage> + Unpin + Send,
        PgWireError: From<C::Error>,
    {
        for (room, msg) in self.take_pending() {
            let note = NotificationResponse::new(self.pid, room.to_string(), msg.to_json());
            client
                .send(PgWireBackendMessage::NotificationResponse(note))
                .await?;
        }
        Ok(())
    }
}

impl Drop for FleetHandler {
    fn drop(&mut self) {
        let listening = self.listening.get_mut().unwrap_or_else(|e| e.into_inner());
        listening.rooms.clear();
        if let Some(hub) = &listening.hub {
            hub.prune();
        }
    }
}

fn exec(tag: &'static str, rows: usize) -> Response {
    Response::Execution(Tag::new(tag).with_rows(rows))
}

fn json_text<T: serde::Serialize>(value: &T) -> String {
    serde_json::to_string(value).unwrap_or_default()
}

fn rows<T>(
    schema: Vec<FieldInfo>,
    items: Vec<T>,
    encode: impl Fn(&mut DataRowEncoder, &T) -> PgWireResult<()>,
) -> Response {
    let schema = Arc::new(schema);
    let rows: Vec<PgWireResult<_>> = items
        .iter()
        .map(|item| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encode(&mut encoder, item)?;
            Ok(encoder.take_row())
        })
        .collect();
    Response::Query(QueryResponse::new(schema, stream::iter(rows)))
}

fn encode_booking(e: &mut DataRowEncoder, b: &Booking) -> PgWireResult<()> {
    e.encode_field(&b.id.to_string())?;
    e.encode_field(&b.user_id.to_string())?;
    e.encode_field(&b.vehicle_id.to_string())?;
    e.encode_field(&b.station_id.to_string())?;
    e.encode_field(&b.span.start)?;
    e.encode_field(&b.span.end)?;
    e.encode_field(&b.original_end)?;
    e.encode_field(&b.status.to_string())?;
    e.encode_field(&b.payment_status.to_string())?;
    e.encode_field(&b.payment_id)?;
    e.encode_field(&b.payment_deadline)?;
    e.encode_field(&b.total_cost)?;
    e.encode_field(&b.cancel_reason.map(|r| r.to_string()))?;
    e.encode_field(&json_text(&b.modifications))?;
    e.encode_field(&json_text(&b.emergency_contacts))?;
    e.encode_field(&b.reminder_sent)?;
    e.encode_field(&(b.version as i64))?;
    e.encode_field(&b.created_at)?;
    e.encode_field(&b.updated_at)
}

// ── Result schemas ───────────────────────────────────────────────

fn field(name: &str, ty: Type) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, ty, FieldFormat::Text)
}

fn booking_schema() -> Vec<FieldInfo> {
    vec![
        field("id", Type::VARCHAR),
        field("user_id", Type::VARCHAR),
        field("vehicle_id", Type::VARCHAR),
        field("station_id", Type::VARCHAR),
        field("start", Type::INT8),
        field("end", Type::INT8),
        field("original_end", Type::INT8),
        field("status", Type::VARCHAR),
        field("payment_status", Type::VARCHAR),
        field("payment_id", Type::VARCHAR),
        field("payment_deadline", Type::INT8),
        field("total_cost", Type::INT8),
        field("cancel_reason", Type::VARCHAR),
        field("modifications", Type::VARCHAR),
        field("emergency_contacts", Type::VARCHAR),
        field("reminder_sent", Type::BOOL),
        field("version", Type::INT8),
        field("created_at", Type::INT8),
        field("updated_at", Type::INT8),
    ]
}

fn slot_schema() -> Vec<FieldInfo> {
    vec![
        field("booking_id", Type::VARCHAR),
        field("start", Type::INT8),
        field("end", Type::INT8),
        field("status", Type::VARCHAR),
    ]
}

fn availability_schema() -> Vec<FieldInfo> {
    vec![
        field("vehicle_id", Type::VARCHAR),
        field("start", Type::INT8),
        field("end", Type::INT8),
    ]
}

fn vehicle_schema() -> Vec<FieldInfo> {
    vec![
        field("id", Type::VARCHAR),
        field("station_id", Type::VARCHAR),
        field("model_name", Type::VARCHAR),
        field("image_url", Type::VARCHAR),
        field("price_per_hour", Type::INT8),
        field("status", Type::VARCHAR),
        field("available_after", Type::INT8),
    ]
}

fn station_schema() -> Vec<FieldInfo> {
    vec![
        field("id", Type::VARCHAR),
        field("name", Type::VARCHAR),
        field("location", Type::VARCHAR),
        field("created_at", Type::INT8),
    ]
}

fn user_schema() -> Vec<FieldInfo> {
    vec![
        field("id", Type::VARCHAR),
        field("name", Type::VARCHAR),
        field("role", Type::VARCHAR),
        field("station_id", Type::VARCHAR),
        field("active", Type::BOOL),
        field("created_at", Type::INT8),
    ]
}

fn dashboard_schema() -> Vec<FieldInfo> {
    vec![
        field("station_id", Type::VARCHAR),
        field("total_vehicles", Type::INT8),
        field("available", Type::INT8),
        field("reserved", Type::INT8),
        field("in_use", Type::INT8),
        field("maintenance", Type::INT8),
        field("pending", Type::INT8),
        field("confirmed", Type::INT8),
        field("active", Type::INT8),
        field("overdue", Type::VARCHAR),
    ]
}

fn notification_schema() -> Vec<FieldInfo> {
    vec![
        field("id", Type::VARCHAR),
        field("user_id", Type::VARCHAR),
        field("title", Type::VARCHAR),
        field("message", Type::VARCHAR),
        field("type", Type::VARCHAR),
        field("priority", Type::VARCHAR),
        field("channels", Type::VARCHAR),
        field("read", Type::BOOL),
        field("created_at", Type::INT8),
        field("expires_at", Type::INT8),
        field("total", Type::INT8),
        field("unread", Type::INT8),
    ]
}

/// Row shape of a SELECT, from the table named after FROM. Empty for
/// anything that returns no rows.
fn result_schema(sql: &str) -> Vec<FieldInfo> {
    let lower = sql.to_ascii_lowercase();
    if !lower.trim_start().starts_with("select") {
        return vec![];
    }
    let table = lower
        .split_whitespace()
        .skip_while(|w| *w != "from")
        .nth(1)
        .map(|t| t.trim_matches(|c| c == '"' || c == ';'));
    match table {
        Some("bookings") | Some("active_rides") => booking_schema(),
        Some("booked_slots") => slot_schema(),
        Some("availability") => availability_schema(),
        Some("vehicles") => vehicle_schema(),
        Some("stations") => station_schema(),
        Some("users") => user_schema(),
        Some("dashboard") => dashboard_schema(),
        Some("notifications") => notification_schema(),
        _ => vec![],
    }
}

#[async_trait]
impl SimpleQueryHandler for FleetHandler {
    async fn do_query<C>(&self, client: &mut C, query: &str) -> PgWireResult<Vec<Response>>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let (tenant, actor) = self.session(client)?;
        let result = self.run(&tenant, &actor, query).await;
        self.forward_notifications(client).await?;
        Ok(vec![result?])
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct FleetQueryParser;

#[async_trait]
impl QueryParser for FleetQueryParser {
    type Statement = String;

    async fn parse_sql<C>(
        &self,
        _client: &C,
        sql: &str,
        _types: &[Option<Type>],
    ) -> PgWireResult<String>
    where
        C: ClientInfo + Unpin + Send + Sync,
    {
        Ok(sql.to_string())
    }

    fn get_parameter_types(&self, stmt: &String) -> PgWireResult<Vec<Type>> {
        Ok(vec![Type::VARCHAR; count_params(stmt)])
    }

    fn get_result_schema(
        &self,
        stmt: &String,
        _column_format: Option<&Format>,
    ) -> PgWireResult<Vec<FieldInfo>> {
        Ok(result_schema(stmt))
    }
}

#[async_trait]
impl ExtendedQueryHandler for FleetHandler {
    type Statement = String;
    type QueryParser = FleetQueryParser;

    fn query_parser(&self) -> Arc<Self::QueryParser> {
        self.query_parser.clone()
    }

    async fn do_query<C>(
        &self,
        client: &mut C,
        portal: &Portal<Self::Statement>,
        _max_rows: usize,
    ) -> PgWireResult<Response>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::PortalStore: PortalStore<Statement = Self::Statement>,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let (tenant, actor) = self.session(client)?;
        let sql = substitute_params(portal);
        let result = self.run(&tenant, &actor, &sql).await;
        self.forward_notifications(client).await?;
        Ok(result?)
    }

    async fn do_describe_statement<C>(
        &self,
        _client: &mut C,
        target: &StoredStatement<Self::Statement>,
    ) -> PgWireResult<DescribeStatementResponse>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::PortalStore: PortalStore<Statement = Self::Statement>,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let param_types = vec![Type::VARCHAR; count_params(&target.statement)];
        Ok(DescribeStatementResponse::new(
            param_types,
            result_schema(&target.statement),
        ))
    }

    async fn do_describe_portal<C>(
        &self,
        _client: &mut C,
        target: &Portal<Self::Statement>,
    ) -> PgWireResult<DescribePortalResponse>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::PortalStore: PortalStore<Statement = Self::Statement>,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        Ok(DescribePortalResponse::new(result_schema(
            &target.statement.statement,
        )))
    }
}

/// Highest $N placeholder in the statement.
fn count_params(sql: &str) -> usize {
    let bytes = sql.as_bytes();
    let mut max = 0usize;
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] != b'$' {
            i += 1;
            continue;
        }
        i += 1;
        let start = i;
        while i < bytes.len() && bytes[i].is_ascii_digit() {
            i += 1;
        }
        if let Ok(n) = sql[start..i].parse::<usize>() {
            max = max.max(n);
        }
    }
    max
}

/// Inline bound text parameters as quoted literals. Highest index first so
/// `$1` never clobbers the prefix of `$10`.
fn substitute_params(portal: &Portal<String>) -> String {
    let mut sql = portal.statement.statement.clone();
    for (i, param) in portal.parameters.iter().enumerate().rev() {
        let value = match param {
            Some(bytes) => format!("'{}'", String::from_utf8_lossy(bytes).replace('\'', "''")),
            None => "NULL".to_string(),
        };
        sql = sql.replace(&format!("${}", i + 1), &value);
    }
    sql
}

// ── Factory ──────────────────────────────────────────────────────

pub struct FleetFactory {
    handler: Arc<FleetHandler>,
    auth_handler:
        Arc<CleartextPasswordAuthStartupHandler<FleetAuthSource, DefaultServerParameterProvider>>,
    noop: Arc<NoopHandler>,
}

impl FleetFactory {
    pub fn new(tenants: Arc<TenantManager>, password: String, operator: String) -> Self {
        let auth_source = FleetAuthSource::new(password, operator.clone(), tenants.clone());
        Self {
            handler: Arc::new(FleetHandler::new(tenants, operator)),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(
                auth_source,
                DefaultServerParameterProvider::default(),
            )),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for FleetFactory {
    fn simple_query_handler(&self) -> Arc<impl SimpleQueryHandler> {
        self.handler.clone()
    }

    fn extended_query_handler(&self) -> Arc<impl ExtendedQueryHandler> {
        self.handler.clone()
    }

    fn startup_handler(&self) -> Arc<impl StartupHandler> {
        self.auth_handler.clone()
    }

    fn copy_handler(&self) -> Arc<impl CopyHandler> {
        self.noop.clone()
    }
}

/// Serve one client until it disconnects.
pub async fn process_connection(
    socket: TcpStream,
    tenants: Arc<TenantManager>,
    password: String,
    operator: String,
    tls: Option<TlsAcceptor>,
) -> std::io::Result<()> {
    let factory = FleetFactory::new(tenants, password, operator);
    process_socket(socket, tls, factory).await
}
