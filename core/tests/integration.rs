//! Session lifecycle tests against the live mock server.
//!
//! # Design
//! Each test starts its own mock server on a random port and drives a
//! `Session` over real HTTP with `UreqTransport`. The server state is shared
//! with the test so sign-outs and deletions can be checked directly.

use std::sync::Arc;

use mock_server::{Backend, Db, DEMO_APP, DEMO_PASSWORD, DEMO_TASKS_DBID, DEMO_USER, OTHER_USER};
use qb_core::{
    with_session, AccessLevel, ClientOptions, Credentials, DbId, Error, FieldId, FieldProperties, FieldType,
    FieldValues, Permission, Query, ResultsFormat, Session, UreqTransport,
};
use tokio::sync::RwLock;

/// Start the mock server on a random port and return its options and state.
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

fn demo() -> Credentials {
    Credentials::new(DEMO_USER, DEMO_PASSWORD)
}

fn sign_in(options: &ClientOptions) -> Session<UreqTransport> {
    Session::sign_in(UreqTransport::new(options.timeout()), &demo(), Some(DEMO_APP), options.clone()).unwrap()
}

// ---------------------------------------------------------------------------
// End-to-end
// ---------------------------------------------------------------------------

#[test]
fn create_edit_fetch_delete_lifecycle() {
    let (options, db) = start_server();
    let transport = UreqTransport::new(options.timeout());

    let dbid = with_session(&transport, &demo(), None, options.clone(), |session| {
        let created = session.create_database("T", "lifecycle test")?;
        let dbid = created.dbid;
        let field = session.add_field(&dbid, "Name", &FieldType::Text)?;
        assert_eq!(field.label, "Name");

        let record = session.add_record(&dbid, &FieldValues::new().with(field.id, "v1"))?;
        let edited = session.edit_record(
            &dbid,
            record.rid,
            &FieldValues::new().with(field.id, "v2"),
            Some(&record.update_id),
        )?;
        assert_eq!(edited.fields_changed, 1);

        let info = session.get_record_info(&dbid, record.rid)?;
        assert_eq!(info.value(field.id), Some("v2"));

        session.delete_database(&dbid)?;
        Ok::<_, Error>(dbid)
    })
    .unwrap();

    let state = db.blocking_read();
    assert!(!state.has_database(dbid.as_str()));
    assert_eq!(state.sign_outs(), 1);
    assert_eq!(state.active_tickets(), 0);
}

#[test]
fn failed_operation_still_signs_out_once() {
    let (options, db) = start_server();
    let transport = UreqTransport::new(options.timeout());

    let err = with_session(&transport, &demo(), None, options, |session| {
        session.get_db_info(&DbId::new("bqnothere"))
    })
    .unwrap_err();

    assert!(err.is_not_found());
    assert_eq!(db.blocking_read().sign_outs(), 1);
}

#[test]
fn dropped_session_signs_out() {
    let (options, db) = start_server();
    {
        let session = sign_in(&options);
        assert!(session.app_dbid().is_some());
    }
    assert_eq!(db.blocking_read().sign_outs(), 1);
}

#[test]
fn unknown_application_signs_out_before_failing() {
    let (options, db) = start_server();
    let err = Session::sign_in(
        UreqTransport::new(options.timeout()),
        &demo(),
        Some("No Such App"),
        options,
    )
    .unwrap_err();

    assert!(matches!(err, Error::Api { .. }), "{err:?}");
    let state = db.blocking_read();
    assert_eq!(state.sign_outs(), 1);
    assert_eq!(state.active_tickets(), 0);
}

#[test]
fn bad_password_is_an_auth_error() {
    let (options, db) = start_server();
    let err = Session::sign_in(
        UreqTransport::new(options.timeout()),
        &Credentials::new(DEMO_USER, "wrong"),
        None,
        options,
    )
    .unwrap_err();

    assert!(matches!(err, Error::Auth { .. }), "{err:?}");
    assert_eq!(db.blocking_read().sign_outs(), 0);
}

// ---------------------------------------------------------------------------
// Database lifecycle properties
// ---------------------------------------------------------------------------

#[test]
fn deleted_database_is_unreachable() {
    let (options, _db) = start_server();
    let mut session = sign_in(&options);

    let dbid = session.create_database("scratch", "to be deleted").unwrap().dbid;
    assert_eq!(session.get_db_info(&dbid).unwrap().num_records, 0);
    session.delete_database(&dbid).unwrap();

    let err = session.get_db_info(&dbid).unwrap_err();
    assert!(matches!(err, Error::Api { .. }), "{err:?}");
    assert!(err.is_not_found());
    session.sign_out().unwrap();
}

#[test]
fn structure_only_clone_has_same_fields_and_no_records() {
    let (options, _db) = start_server();
    let mut session = sign_in(&options);
    let tasks = DbId::new(DEMO_TASKS_DBID);

    let source = session.get_schema(&tasks).unwrap();
    let clone = session.clone_database(&tasks, "Tasks copy", "structure only", false).unwrap();
    let copied = session.get_schema(&clone).unwrap();

    assert_eq!(copied.fields, source.fields);
    assert_eq!(session.get_num_records(&clone).unwrap(), 0);
    assert_eq!(session.get_num_records(&tasks).unwrap(), 2, "source untouched");

    session.delete_database(&clone).unwrap();
    session.sign_out().unwrap();
}

#[test]
fn added_record_reads_back() {
    let (options, _db) = start_server();
    let mut session = sign_in(&options);
    let tasks = DbId::new(DEMO_TASKS_DBID);

    let values = FieldValues::new().with(FieldId(6), "Plan sprint").with("Status", "Open");
    let record = session.add_record(&tasks, &values).unwrap();
    let info = session.get_record_info(&tasks, record.rid).unwrap();

    assert_eq!(info.rid, record.rid);
    assert_eq!(info.update_id, record.update_id);
    assert_eq!(info.value(FieldId(6)), Some("Plan sprint"));
    assert_eq!(info.value(FieldId(7)), Some("Open"));

    session.delete_record(&tasks, record.rid).unwrap();
    let err = session.get_record_info(&tasks, record.rid).unwrap_err();
    assert_eq!(err.code().map(|c| c.0), Some(30));
    assert_eq!(session.get_num_records(&tasks).unwrap(), 2);
}

#[test]
fn stale_update_id_conflicts_and_current_one_advances() {
    let (options, _db) = start_server();
    let mut session = sign_in(&options);
    let tasks = DbId::new(DEMO_TASKS_DBID);

    let record = session
        .add_record(&tasks, &FieldValues::new().with(FieldId(6), "first"))
        .unwrap();
    let edited = session
        .edit_record(
            &tasks,
            record.rid,
            &FieldValues::new().with(FieldId(6), "second"),
            Some(&record.update_id),
        )
        .unwrap();
    assert_ne!(edited.update_id, record.update_id);

    let err = session
        .edit_record(
            &tasks,
            record.rid,
            &FieldValues::new().with(FieldId(6), "third"),
            Some(&record.update_id),
        )
        .unwrap_err();
    assert!(err.is_conflict(), "{err:?}");
    assert_eq!(session.last_error().map(|(code, _)| code.0), Some(60));

    let info = session.get_record_info(&tasks, record.rid).unwrap();
    assert_eq!(info.value(FieldId(6)), Some("second"));
    assert!(session.last_error().is_none());
}

#[test]
fn choices_add_then_remove() {
    let (options, _db) = start_server();
    let mut session = sign_in(&options);
    let dbid = session.create_database("choices", "").unwrap().dbid;
    let field = session.add_field(&dbid, "Grade", &FieldType::Text).unwrap();

    assert_eq!(session.field_add_choices(&dbid, field.id, &["a", "b", "c"]).unwrap(), 3);
    assert_eq!(session.field_remove_choices(&dbid, field.id, &["b"]).unwrap(), 1);

    let schema = session.get_schema(&dbid).unwrap();
    let choices = &schema.field(field.id).unwrap().choices;
    assert_eq!(choices, &["a".to_string(), "c".to_string()]);

    let date = session.add_field(&dbid, "Due", &FieldType::Date).unwrap();
    let err = session.field_add_choices(&dbid, date.id, &["tomorrow"]).unwrap_err();
    assert_eq!(err.code().map(|c| c.0), Some(10));

    session.delete_database(&dbid).unwrap();
}

#[test]
fn udata_round_trips() {
    let (options, _db) = start_server();
    let mut session = sign_in(&options);
    let tasks = DbId::new(DEMO_TASKS_DBID);

    session.set_udata("corr <42> & more");
    session.change_record_owner(&tasks, qb_core::RecordId(1), OTHER_USER).unwrap();
    assert_eq!(session.last_udata(), Some("corr <42> & more"));
    session.verify_udata("corr <42> & more").unwrap();

    // udata applies to one call only
    session.get_num_records(&tasks).unwrap();
    let err = session.verify_udata("corr <42> & more").unwrap_err();
    assert!(matches!(err, Error::Integrity { received: None, .. }), "{err:?}");
}

#[test]
fn padded_values_and_udata_come_back_unchanged() {
    let (options, _db) = start_server();
    let mut session = sign_in(&options);
    let tasks = DbId::new(DEMO_TASKS_DBID);

    session.set_udata("  padded  ");
    let values = FieldValues::new().with(FieldId(6), "  two spaces  ").with("Status", "   ");
    let record = session.add_record(&tasks, &values).unwrap();
    assert_eq!(session.last_udata(), Some("  padded  "));
    session.verify_udata("  padded  ").unwrap();

    let info = session.get_record_info(&tasks, record.rid).unwrap();
    assert_eq!(info.value(FieldId(6)), Some("  two spaces  "));
    assert_eq!(info.value(FieldId(7)), Some("   "));
}

// ---------------------------------------------------------------------------
// Remaining operations
// ---------------------------------------------------------------------------

#[test]
fn query_and_render() {
    let (options, _db) = start_server();
    let mut session = sign_in(&options);
    let tasks = DbId::new(DEMO_TASKS_DBID);

    let open: Vec<_> = session
        .do_query(&tasks, &Query::filter("{'7'.EX.'Open'}").columns([FieldId(6)]))
        .unwrap()
        .collect::<Result<_, _>>()
        .unwrap();
    assert_eq!(open.len(), 1);
    assert_eq!(open[0].value(FieldId(6)), Some("Write report"));

    let saved = session.do_query(&tasks, &Query::saved(2)).unwrap().count();
    assert_eq!(saved, 1);

    let csv = session
        .gen_results_table(&tasks, &Query::all().columns([FieldId(6), FieldId(7)]), ResultsFormat::Csv)
        .unwrap();
    assert!(csv.starts_with("\"Task\",\"Status\""));

    let html = session.get_record_as_html(&tasks, qb_core::RecordId(2)).unwrap();
    assert!(html.contains("File expenses"));

    let form = session
        .gen_add_record_form(&tasks, &FieldValues::new().with(FieldId(6), "prefilled"))
        .unwrap();
    assert!(form.contains("prefilled"));
}

#[test]
fn permissions_pages_and_fields() {
    let (options, _db) = start_server();
    let mut session = sign_in(&options);
    let dbid = session.create_database("admin", "").unwrap().dbid;

    let granted = Permission {
        modify: AccessLevel::Owner,
        delete: AccessLevel::None,
        ..Permission::default()
    };
    let echoed = session.change_permission(&dbid, OTHER_USER, &granted).unwrap();
    assert_eq!(echoed, granted);

    let page_id = session
        .add_replace_db_page(&dbid, &"notes.html".into(), qb_core::PageType::Html, "<p>hi</p>")
        .unwrap();
    let page = session.get_db_page(&dbid, &qb_core::PageRef::Id(page_id)).unwrap();
    assert!(page.contains("<p>hi</p>"));

    let stylesheet = concat!(
        r#"<?xml version="1.0" encoding="UTF-8"?>"#,
        "\n",
        r#"<xsl:stylesheet version="1.0" xmlns:xsl="http://www.w3.org/1999/XSL/Transform">"#,
        r#"<xsl:template match="/"><p>styled</p></xsl:template></xsl:stylesheet>"#,
    );
    let xsl_id = session
        .add_replace_db_page(&dbid, &"style.xsl".into(), qb_core::PageType::Html, stylesheet)
        .unwrap();
    assert_ne!(xsl_id, page_id);
    let fetched = session.get_db_page(&dbid, &"style.xsl".into()).unwrap();
    assert_eq!(fetched, stylesheet);

    let field = session.add_field(&dbid, "Scratch", &FieldType::Text).unwrap();
    session
        .set_field_properties(&dbid, field.id, &FieldProperties::new().label("Renamed"))
        .unwrap();
    assert_eq!(session.get_schema(&dbid).unwrap().field(field.id).unwrap().label, "Renamed");
    session.delete_field(&dbid, field.id).unwrap();
    assert!(session.get_schema(&dbid).unwrap().field(field.id).is_none());

    let err = session.delete_field(&dbid, FieldId(3)).unwrap_err();
    assert!(matches!(err, Error::Api { .. }));
    session.delete_database(&dbid).unwrap();
}

#[test]
fn csv_import_then_purge() {
    let (options, _db) = start_server();
    let mut session = sign_in(&options);
    let dbid = session.create_database("import", "").unwrap().dbid;
    let name = session.add_field(&dbid, "Name", &FieldType::Text).unwrap().id;

    let import = qb_core::CsvImport::new("Name\nalpha\nbeta\n\"gamma, delta\"\n", [name])
        .unwrap()
        .skip_first_row(true);
    let summary = session.import_from_csv(&dbid, &import).unwrap();
    assert_eq!((summary.input, summary.added, summary.updated, summary.skipped), (3, 3, 0, 0));
    assert_eq!(summary.records.len(), 3);

    let rid = summary.records[0].rid;
    let update = qb_core::CsvImport::new(format!("{rid},ALPHA\n999,ghost").as_str(), [FieldId(3), name]).unwrap();
    let summary = session.import_from_csv(&dbid, &update).unwrap();
    assert_eq!((summary.input, summary.added, summary.updated, summary.skipped), (2, 0, 1, 1));
    assert_eq!(session.get_record_info(&dbid, rid).unwrap().value(name), Some("ALPHA"));

    assert_eq!(session.get_num_records(&dbid).unwrap(), 3);
    let purged = session.purge_records(&dbid, Some(&Query::filter(format!("{{'{name}'.SW.'b'}}")))).unwrap();
    assert_eq!(purged, 1);
    assert_eq!(session.purge_records(&dbid, None).unwrap(), 2);
    assert_eq!(session.get_num_records(&dbid).unwrap(), 0);
    session.delete_database(&dbid).unwrap();
}

#[test]
fn quoted_cell_with_blank_line_imports_as_one_record() {
    let (options, _db) = start_server();
    let mut session = sign_in(&options);
    let dbid = session.create_database("notes", "").unwrap().dbid;
    let note = session.add_field(&dbid, "Note", &FieldType::Text).unwrap().id;

    let import = qb_core::CsvImport::new("\"first line\n\nthird line\"\nsecond record\n", [note]).unwrap();
    assert_eq!(import.row_count(), 2);
    let summary = session.import_from_csv(&dbid, &import).unwrap();
    assert_eq!((summary.input, summary.added), (2, 2));

    let info = session.get_record_info(&dbid, summary.records[0].rid).unwrap();
    assert_eq!(info.value(note), Some("first line\n\nthird line"));
    session.delete_database(&dbid).unwrap();
}

#[test]
fn non_throwing_execute_returns_error_replies() {
    let (options, _db) = start_server();
    let options = ClientOptions {
        throw_on_error: false,
        ..options
    };
    let mut session = sign_in(&options);

    let call = session.client().build_get_record_info(&DbId::new(DEMO_TASKS_DBID), qb_core::RecordId(404));
    let response = session.execute(call).unwrap();
    assert_eq!(response.errcode().0, 30);
    assert!(response.error().is_some());
    assert_eq!(session.last_error().map(|(code, _)| code.0), Some(30));
}

#[test]
fn granted_dbs_list_the_demo_app() {
    let (options, _db) = start_server();
    let mut session = sign_in(&options);
    let dbs = session.granted_dbs().unwrap();
    assert!(dbs.iter().any(|d| d.name.contains(DEMO_APP)));

    let app = session.app_dbid().cloned().unwrap();
    let schema = session.get_schema(&app).unwrap();
    assert_eq!(schema.child_tables.len(), 1);
    assert_eq!(schema.child_tables[0].dbid.as_str(), DEMO_TASKS_DBID);
}
