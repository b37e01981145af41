use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use futures::{StreamExt, stream};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_postgres::{AsyncMessage, Client, Config, NoTls, Notification, SimpleQueryMessage};
use ulid::Ulid;

use evfleet::limits::{HOUR_MS, Policy};
use evfleet::sweeper::SweepIntervals;
use evfleet::tenant::TenantManager;
use evfleet::wire;

const PASSWORD: &str = "evfleet";
const OPERATOR: &str = "evfleet";

// ── Test infrastructure ──────────────────────────────────────

async fn start_test_server() -> (SocketAddr, Arc<TenantManager>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let dir = std::env::temp_dir().join(format!("evfleet_int_test_{}", Ulid::new()));
    std::fs::create_dir_all(&dir).unwrap();
    // Round-the-clock stations so the wall clock never trips operating hours.
    let policy = Policy {
        open_hour: 0,
        close_hour: 24,
        ..Policy::default()
    };
    let tm = Arc::new(TenantManager::new(dir, 1000, policy, SweepIntervals::default()));

    let tm2 = tm.clone();
    tokio::spawn(async move {
        loop {
            let (socket, _) = match listener.accept().await {
                Ok(conn) => conn,
                Err(_) => break,
            };
            let tm = tm2.clone();
            tokio::spawn(async move {
                let _ = wire::process_connection(
                    socket,
                    tm,
                    PASSWORD.to_string(),
                    OPERATOR.to_string(),
                    None,
                )
                .await;
            });
        }
    });

    (addr, tm)
}

async fn connect(
    addr: SocketAddr,
    db: &str,
    user: &str,
) -> Result<(Client, mpsc::UnboundedReceiver<Notification>), tokio_postgres::Error> {
    let mut config = Config::new();
    config
        .host(addr.ip().to_string())
        .port(addr.port())
        .dbname(db)
        .user(user)
        .password(PASSWORD);

    let (client, mut connection) = config.connect(NoTls).await?;

    let (tx, rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        let stream = stream::poll_fn(move |cx| connection.poll_message(cx));
        futures::pin_mut!(stream);
        while let Some(msg) = stream.next().await {
            match msg {
                Ok(AsyncMessage::Notification(n)) => {
                    let _ = tx.send(n);
                }
                Ok(_) => {}
                Err(_) => break,
            }
        }
    });

    Ok((client, rx))
}

async fn recv_notification(
    rx: &mut mpsc::UnboundedReceiver<Notification>,
    timeout: Duration,
) -> Option<Notification> {
    tokio::time::timeout(timeout, rx.recv()).await.ok().flatten()
}

fn data_rows(messages: &[SimpleQueryMessage]) -> Vec<&tokio_postgres::SimpleQueryRow> {
    messages
        .iter()
        .filter_map(|m| match m {
            SimpleQueryMessage::Row(row) => Some(row),
            _ => None,
        })
        .collect()
}

fn sqlstate(err: &tokio_postgres::Error) -> Option<&str> {
    err.code().map(|c| c.code())
}

/// A whole hour two days out, so lead time is always satisfied.
fn future_hour() -> i64 {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_millis() as i64;
    (now / HOUR_MS + 48) * HOUR_MS
}

struct Fleet {
    db: String,
    station: Ulid,
    master: Ulid,
    customer: Ulid,
    vehicle: Ulid,
}

/// Operator login seeds a station, its master, a customer and one vehicle.
async fn seed(addr: SocketAddr) -> Fleet {
    let fleet = Fleet {
        db: format!("fleet_{}", Ulid::new()),
        station: Ulid::new(),
        master: Ulid::new(),
        customer: Ulid::new(),
        vehicle: Ulid::new(),
    };
    let (op, _rx) = connect(addr, &fleet.db, OPERATOR).await.unwrap();
    op.batch_execute(&format!(
        "INSERT INTO stations (id, name, location) VALUES ('{}', 'Harbour', 'Pier 4')",
        fleet.station
    ))
    .await
    .unwrap();
    op.batch_execute(&format!(
        "INSERT INTO users (id, name, role, station_id) VALUES ('{}', 'Mira', 'station-master', '{}')",
        fleet.master, fleet.station
    ))
    .await
    .unwrap();
    op.batch_execute(&format!(
        "INSERT INTO users (id, name, role) VALUES ('{}', 'Tomas', 'customer')",
        fleet.customer
    ))
    .await
    .unwrap();
    op.batch_execute(&format!(
        "INSERT INTO vehicles (id, station_id, model_name, price_per_hour) VALUES ('{}', '{}', 'Ioniq 5', 2000)",
        fleet.vehicle, fleet.station
    ))
    .await
    .unwrap();
    fleet
}

async fn book(client: &Client, vehicle: Ulid, start: i64, end: i64) -> Result<Ulid, tokio_postgres::Error> {
    let id = Ulid::new();
    client
        .batch_execute(&format!(
            r#"INSERT INTO bookings (id, vehicle_id, start, "end") VALUES ('{id}', '{vehicle}', {start}, {end})"#
        ))
        .await?;
    Ok(id)
}

// ── Tests ────────────────────────────────────────────────────

#[tokio::test]
async fn customer_books_and_master_confirms() {
    let (addr, _tm) = start_test_server().await;
    let fleet = seed(addr).await;
    let start = future_hour();

    let (customer, _rx) = connect(addr, &fleet.db, &fleet.customer.to_string())
        .await
        .unwrap();
    let booking = book(&customer, fleet.vehicle, start, start + 2 * HOUR_MS)
        .await
        .unwrap();

    let (master, _mrx) = connect(addr, &fleet.db, &fleet.master.to_string())
        .await
        .unwrap();
    master
        .batch_execute(&format!(
            "UPDATE bookings SET status = 'confirmed' WHERE id = '{booking}'"
        ))
        .await
        .unwrap();

    let rows = customer
        .simple_query(&format!("SELECT * FROM bookings WHERE id = '{booking}'"))
        .await
        .unwrap();
    let rows = data_rows(&rows);
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].get("status"), Some("confirmed"));
    assert_eq!(rows[0].get("total_cost"), Some("4000"));
    assert!(rows[0].get("payment_deadline").is_some());
}

#[tokio::test]
async fn overlapping_booking_is_a_conflict() {
    let (addr, _tm) = start_test_server().await;
    let fleet = seed(addr).await;
    let start = future_hour();

    let (customer, _rx) = connect(addr, &fleet.db, &fleet.customer.to_string())
        .await
        .unwrap();
    book(&customer, fleet.vehicle, start, start + 2 * HOUR_MS)
        .await
        .unwrap();

    let err = book(&customer, fleet.vehicle, start + HOUR_MS, start + 3 * HOUR_MS)
        .await
        .unwrap_err();
    assert_eq!(sqlstate(&err), Some("23P01"));

    // Back-to-back is fine.
    book(&customer, fleet.vehicle, start + 2 * HOUR_MS, start + 3 * HOUR_MS)
        .await
        .unwrap();
}

#[tokio::test]
async fn customers_cannot_touch_the_directory() {
    let (addr, _tm) = start_test_server().await;
    let fleet = seed(addr).await;

    let (customer, _rx) = connect(addr, &fleet.db, &fleet.customer.to_string())
        .await
        .unwrap();
    let err = customer
        .batch_execute(&format!(
            "INSERT INTO stations (id, name) VALUES ('{}', 'Rogue')",
            Ulid::new()
        ))
        .await
        .unwrap_err();
    assert_eq!(sqlstate(&err), Some("42501"));

    let err = customer
        .batch_execute(&format!("LISTEN station_{}", fleet.station))
        .await
        .unwrap_err();
    assert_eq!(sqlstate(&err), Some("42501"));
}

#[tokio::test]
async fn unknown_login_is_rejected() {
    let (addr, _tm) = start_test_server().await;
    let fleet = seed(addr).await;
    assert!(connect(addr, &fleet.db, &Ulid::new().to_string()).await.is_err());
    assert!(connect(addr, &fleet.db, "nobody").await.is_err());
}

#[tokio::test]
async fn listener_receives_booking_updates() {
    let (addr, _tm) = start_test_server().await;
    let fleet = seed(addr).await;
    let start = future_hour();

    let (customer, mut rx) = connect(addr, &fleet.db, &fleet.customer.to_string())
        .await
        .unwrap();
    customer
        .batch_execute(&format!("LISTEN user_{}", fleet.customer))
        .await
        .unwrap();
    let booking = book(&customer, fleet.vehicle, start, start + 2 * HOUR_MS)
        .await
        .unwrap();

    let (master, _mrx) = connect(addr, &fleet.db, &fleet.master.to_string())
        .await
        .unwrap();
    master
        .batch_execute(&format!(
            "UPDATE bookings SET status = 'confirmed' WHERE id = '{booking}'"
        ))
        .await
        .unwrap();

    // Buffered messages go out with the listener's next query.
    customer.simple_query("SELECT * FROM stations").await.unwrap();

    let notif = recv_notification(&mut rx, Duration::from_secs(5))
        .await
        .expect("expected notification");
    assert_eq!(notif.channel(), format!("user_{}", fleet.customer));
    let parsed: serde_json::Value = serde_json::from_str(notif.payload())
        .expect("notification payload should be valid JSON");
    assert!(parsed.get("event").is_some());
}

#[tokio::test]
async fn unlisten_stops_forwarding() {
    let (addr, _tm) = start_test_server().await;
    let fleet = seed(addr).await;
    let start = future_hour();

    let (customer, mut rx) = connect(addr, &fleet.db, &fleet.customer.to_string())
        .await
        .unwrap();
    customer
        .batch_execute(&format!("LISTEN user_{}", fleet.customer))
        .await
        .unwrap();
    customer.batch_execute("UNLISTEN *").await.unwrap();

    book(&customer, fleet.vehicle, start, start + 2 * HOUR_MS)
        .await
        .unwrap();
    customer.simple_query("SELECT * FROM stations").await.unwrap();

    let notif = recv_notification(&mut rx, Duration::from_millis(500)).await;
    assert!(notif.is_none(), "should not receive notifications after UNLISTEN *");
}

#[tokio::test]
async fn inbox_is_readable_over_the_wire() {
    let (addr, _tm) = start_test_server().await;
    let fleet = seed(addr).await;
    let start = future_hour();

    let (customer, _rx) = connect(addr, &fleet.db, &fleet.customer.to_string())
        .await
        .unwrap();
    let booking = book(&customer, fleet.vehicle, start, start + 2 * HOUR_MS)
        .await
        .unwrap();
    let (master, _mrx) = connect(addr, &fleet.db, &fleet.master.to_string())
        .await
        .unwrap();
    master
        .batch_execute(&format!(
            "UPDATE bookings SET status = 'confirmed' WHERE id = '{booking}'"
        ))
        .await
        .unwrap();

    let rows = customer
        .simple_query("SELECT * FROM notifications")
        .await
        .unwrap();
    let rows = data_rows(&rows);
    assert!(!rows.is_empty());
    assert_eq!(rows[0].get("read"), Some("f"));

    customer
        .batch_execute("UPDATE notifications SET read = true")
        .await
        .unwrap();
    let rows = customer
        .simple_query("SELECT * FROM notifications")
        .await
        .unwrap();
    assert_eq!(data_rows(&rows)[0].get("unread"), Some("0"));
}
