//! Run the demo walk-through against the mock server.

use std::sync::Arc;

use mock_server::{Backend, Db, DEMO_APP, DEMO_APP_DBID, DEMO_PASSWORD, DEMO_USER};
use qb_cli::Scenario;
use qb_core::{with_session, ClientOptions, Credentials, UreqTransport};
use tokio::sync::RwLock;

fn start_server() -> (ClientOptions, Db) {
    let std_listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = std_listener.local_addr().unwrap();
    std_listener.set_nonblocking(true).unwrap();

    let db: Db = Arc::new(RwLock::new(Backend::seeded()));
    let served = db.clone();
    std::thread::spawn(move || {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        rt.block_on(async {
            let listener = tokio::net::TcpListener::from_std(std_listener).unwrap();
            mock_server::serve(listener, served).await
        })
    });

    let options = ClientOptions {
        host: addr.to_string(),
        use_tls: false,
        timeout_secs: 5,
        ..ClientOptions::default()
    };
    (options, db)
}

fn run(scenario: &Scenario, options: ClientOptions) -> anyhow::Result<String> {
    let mut out = Vec::new();
    with_session(
        UreqTransport::new(options.timeout()),
        &Credentials::new(DEMO_USER, DEMO_PASSWORD),
        Some(&scenario.app_name),
        options,
        |session| scenario.run(session, &mut out),
    )?;
    Ok(String::from_utf8(out)?)
}

#[test]
fn full_walk_through() {
    let (options, db) = start_server();
    let scenario = Scenario {
        show_granted_dbs: true,
        ..Scenario::new(DEMO_USER, DEMO_APP)
    };

    let output = run(&scenario, options).unwrap();

    assert!(output.contains(&format!("signed in as {DEMO_USER}")));
    assert!(output.contains("granted databases:"));
    assert!(output.contains(&format!("{DEMO_APP_DBID}: {DEMO_APP}")));
    assert!(output.contains("Write report"), "child table records are listed");
    assert!(output.contains(&format!("cloned {DEMO_APP_DBID} to ")));
    assert!(output.contains("edited record 1 (1 field changed)"));
    assert!(output.contains("\"two\""));
    assert!(output.contains("stored page "));
    assert!(output.contains("imported 2 rows: 2 added, 0 updated, 0 skipped"));
    assert!(output.contains("field 8 The only field in this database!"));
    assert!(output.contains("3 records\n0 records\n"));

    let state = db.blocking_read();
    assert_eq!(state.sign_outs(), 1);
    assert_eq!(state.active_tickets(), 0);
}

#[test]
fn inspection_only() {
    let (options, db) = start_server();
    let scenario = Scenario {
        show_child_dbs: false,
        clone_app: false,
        create_temp_db: false,
        ..Scenario::new(DEMO_USER, DEMO_APP)
    };

    let output = run(&scenario, options).unwrap();
    assert!(output.contains(&format!("{DEMO_APP_DBID}: {DEMO_APP}")));
    assert!(!output.contains("Write report"));
    assert!(!output.contains("created "));
    assert_eq!(db.blocking_read().sign_outs(), 1);
}

#[test]
fn failure_is_reported_and_still_signs_out() {
    let (options, db) = start_server();
    let scenario = Scenario::new(DEMO_USER, "Not An App");

    let err = run(&scenario, options).unwrap_err();
    let err = err.downcast::<qb_core::Error>().unwrap();
    assert!(err.is_not_found());
    assert_eq!(db.blocking_read().sign_outs(), 1);
}
