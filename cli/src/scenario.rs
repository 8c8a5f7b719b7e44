//! The demo walk-through: inspect an application, then take a scratch
//! database through its whole lifecycle.
//!
//! Nothing here modifies existing databases. If a step fails the scratch
//! database (and possibly a clone of the application) is left behind.

use std::io::Write;

use anyhow::{Context, Result};
use qb_core::{
    AccessLevel, CsvImport, DbId, FieldProperties, FieldType, FieldValues, PageRef, PageType, Permission, Query,
    ResultsFormat, Schema, Session, Transport,
};
use tracing::info;

const TEST_PAGE: &str =
    "<HTML><HEAD><TITLE>test page</TITLE></HEAD><BODY>this is a test page</BODY></HTML>";
const OWNER_UDATA: &str = "about to call change_record_owner";

/// Which parts of the walk-through to run.
#[derive(Debug, Clone)]
pub struct Scenario {
    pub username: String,
    pub app_name: String,
    pub show_granted_dbs: bool,
    pub show_child_dbs: bool,
    pub clone_app: bool,
    pub create_temp_db: bool,
}

impl Scenario {
    pub fn new(username: impl Into<String>, app_name: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            app_name: app_name.into(),
            show_granted_dbs: false,
            show_child_dbs: true,
            clone_app: true,
            create_temp_db: true,
        }
    }

    /// Run against a session that already has its application resolved.
    pub fn run<T: Transport, W: Write>(&self, session: &mut Session<T>, out: &mut W) -> Result<()> {
        let app = session
            .app_dbid()
            .cloned()
            .context("session has no application")?;
        writeln!(out, "signed in as {} ({})", self.username, session.user_id().unwrap_or("?"))?;

        if self.show_granted_dbs {
            writeln!(out, "granted databases:")?;
            for db in session.granted_dbs()? {
                writeln!(out, "  {} {}", db.dbid, db.name)?;
            }
        }

        let schema = describe(session, &app, out)?;
        if self.show_child_dbs {
            for child in &schema.child_tables {
                describe(session, &child.dbid, out)?;
            }
        }

        if self.clone_app {
            let name = format!("{}'s temporary copy of {} - OK to delete", self.username, self.app_name);
            let copy = session
                .clone_database(&app, &name, &name, false)
                .context("cloning the application")?;
            writeln!(out, "cloned {app} to {copy}")?;
            session.delete_database(&copy)?;
            writeln!(out, "deleted {copy}")?;
        }

        if self.create_temp_db {
            self.scratch_database(session, out)?;
        }
        Ok(())
    }

    fn scratch_database<T: Transport, W: Write>(&self, session: &mut Session<T>, out: &mut W) -> Result<()> {
        let dbid = session
            .create_database(
                &format!("{}'s test database.", self.username),
                "Test database created by the qdbapi client demo.",
            )?
            .dbid;
        writeln!(out, "created {dbid}")?;
        info!(%dbid, "scratch database created");

        let text = session.add_field(&dbid, "text field", &FieldType::Text)?;
        let file = session.add_field(&dbid, "file attachment field", &FieldType::File)?;
        let choice = session.add_field(&dbid, "choice field", &FieldType::Text)?;
        let added = session.field_add_choices(&dbid, choice.id, &["one", "two", "three", "four", "five"])?;
        if added == 5 {
            session.field_remove_choices(&dbid, choice.id, &["three"])?;
        }

        let values = FieldValues::new()
            .with(text.id, text.id.to_string())
            .with_file(file.id, "aFile.txt", "Contents of aFile.txt")
            .with(choice.id, "four");
        let record = session.add_record(&dbid, &values)?;
        print_record_info(session, &dbid, record.rid, out)?;

        let edited = session.edit_record(
            &dbid,
            record.rid,
            &FieldValues::new().with(choice.id, "two"),
            Some(&record.update_id),
        )?;
        writeln!(out, "edited record {} ({} field changed)", record.rid, edited.fields_changed)?;
        print_record_info(session, &dbid, record.rid, out)?;

        session.set_udata(OWNER_UDATA);
        session.change_record_owner(&dbid, record.rid, &self.username)?;
        session.verify_udata(OWNER_UDATA)?;

        let permission = Permission {
            view: AccessLevel::Any,
            modify: AccessLevel::Any,
            create: true,
            delete: AccessLevel::Any,
            save_views: false,
            admin: true,
        };
        session.change_permission(&dbid, &self.username, &permission)?;

        writeln!(out, "{}", session.get_record_as_html(&dbid, record.rid)?)?;

        session.delete_field(&dbid, text.id)?;
        session.delete_field(&dbid, file.id)?;

        writeln!(out, "{}", session.gen_results_table(&dbid, &Query::all(), ResultsFormat::Csv)?)?;
        writeln!(out, "{}", session.gen_add_record_form(&dbid, &FieldValues::new())?)?;

        let page = session.add_replace_db_page(&dbid, &PageRef::from("test page"), PageType::Html, TEST_PAGE)?;
        writeln!(out, "stored page {page}")?;
        let overview = session.get_db_page(&dbid, &PageRef::from("Default Overview"))?;
        writeln!(out, "default overview: {} bytes", overview.len())?;

        session.set_field_properties(
            &dbid,
            choice.id,
            &FieldProperties::new().label("The only field in this database!"),
        )?;

        let import = CsvImport::new("five\r\none\r\nfour", [choice.id])?.skip_first_row(true);
        let summary = session.import_from_csv(&dbid, &import)?;
        writeln!(
            out,
            "imported {} rows: {} added, {} updated, {} skipped",
            summary.input, summary.added, summary.updated, summary.skipped
        )?;

        print_records(session, &dbid, out)?;
        print_collections(&session.get_schema(&dbid)?, out)?;

        writeln!(out, "{} records", session.get_num_records(&dbid)?)?;
        session.purge_records(&dbid, None)?;
        writeln!(out, "{} records", session.get_num_records(&dbid)?)?;

        session.delete_database(&dbid)?;
        writeln!(out, "deleted {dbid}")?;
        Ok(())
    }
}

/// Print info, schema summary and records of one table, returning its schema.
fn describe<T: Transport, W: Write>(session: &mut Session<T>, dbid: &DbId, out: &mut W) -> Result<Schema> {
    let info = session.get_db_info(dbid)?;
    writeln!(out, "{dbid}: {} ({} records)", info.name, info.num_records)?;
    let schema = session.get_schema(dbid)?;
    for field in &schema.fields {
        writeln!(out, "  field {} {:?} [{}]", field.id, field.label, field.field_type)?;
    }
    print_records(session, dbid, out)?;
    Ok(schema)
}

fn print_records<T: Transport, W: Write>(session: &mut Session<T>, dbid: &DbId, out: &mut W) -> Result<()> {
    for record in session.do_query(dbid, &Query::all())? {
        let record = record?;
        let rid = record.rid.map(|r| r.to_string()).unwrap_or_default();
        let values: Vec<String> = record.values.iter().map(|(fid, v)| format!("{fid}={v:?}")).collect();
        writeln!(out, "  record {rid}: {}", values.join(" "))?;
    }
    Ok(())
}

fn print_record_info<T: Transport, W: Write>(
    session: &mut Session<T>,
    dbid: &DbId,
    rid: qb_core::RecordId,
    out: &mut W,
) -> Result<()> {
    let info = session.get_record_info(dbid, rid)?;
    writeln!(out, "record {} (update {})", info.rid, info.update_id)?;
    for field in &info.fields {
        writeln!(out, "  {} {:?} = {:?}", field.id, field.name, field.value)?;
    }
    Ok(())
}

fn print_collections<W: Write>(schema: &Schema, out: &mut W) -> Result<()> {
    for child in &schema.child_tables {
        writeln!(out, "child table {} {}", child.name, child.dbid)?;
    }
    for query in &schema.queries {
        writeln!(out, "query {} {}", query.id, query.name)?;
    }
    for field in &schema.fields {
        writeln!(out, "field {} {}", field.id, field.label)?;
    }
    for (name, value) in &schema.variables {
        writeln!(out, "variable {name} = {value}")?;
    }
    Ok(())
}
