use std::path::PathBuf;

use clap::Parser;
use qb_core::ClientOptions;

use crate::scenario::Scenario;

/// Command-line arguments of `qb-demo`.
#[derive(Parser, Debug)]
#[command(name = "qb-demo")]
#[command(about = "Walk through the qdbapi client against one application")]
pub struct Args {
    /// JSON file with client options; flags below override it
    #[arg(long, env = "QB_CONFIG")]
    pub config: Option<PathBuf>,

    /// Service host, optionally with a scheme
    #[arg(long, env = "QB_HOST")]
    pub host: Option<String>,

    /// Use plain HTTP
    #[arg(long)]
    pub no_tls: bool,

    /// Log request and response bodies
    #[arg(long)]
    pub log_traffic: bool,

    /// Trace every round trip
    #[arg(long)]
    pub trace: bool,

    #[arg(long)]
    pub timeout_secs: Option<u64>,

    #[arg(long)]
    pub show_granted_dbs: bool,

    #[arg(long)]
    pub skip_child_dbs: bool,

    /// Do not clone and delete a copy of the application
    #[arg(long)]
    pub skip_clone: bool,

    /// Do not create the temporary database
    #[arg(long)]
    pub skip_temp_db: bool,

    pub username: String,

    pub password: String,

    /// Application name; extra words are joined with spaces
    #[arg(required = true, num_args = 1..)]
    pub application_name: Vec<String>,
}

impl Args {
    /// Options from the config file (or defaults) with flags applied on top.
    pub fn client_options(&self) -> qb_core::Result<ClientOptions> {
        let mut options = match &self.config {
            Some(path) => ClientOptions::load(path)?,
            None => ClientOptions::default(),
        };
        if let Some(host) = &self.host {
            options.host = host.clone();
        }
        if self.no_tls {
            options.use_tls = false;
        }
        if let Some(secs) = self.timeout_secs {
            options.timeout_secs = secs;
        }
        options.log_traffic |= self.log_traffic;
        options.trace |= self.trace;
        Ok(options)
    }

    pub fn application_name(&self) -> String {
        self.application_name.join(" ")
    }

    /// Default log filter when `RUST_LOG` is unset.
    pub fn log_filter(&self) -> &'static str {
        if self.trace {
            "info,qb_core=trace"
        } else {
            "info"
        }
    }

    pub fn scenario(&self) -> Scenario {
        Scenario {
            username: self.username.clone(),
            app_name: self.application_name(),
            show_granted_dbs: self.show_granted_dbs,
            show_child_dbs: !self.skip_child_dbs,
            clone_app: !self.skip_clone,
            create_temp_db: !self.skip_temp_db,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trailing_words_form_the_application_name() {
        let args = Args::try_parse_from(["qb-demo", "me@example.com", "pw", "My", "Great", "App"]).unwrap();
        assert_eq!(args.application_name(), "My Great App");
        assert_eq!(args.username, "me@example.com");
    }

    #[test]
    fn missing_application_is_a_usage_error() {
        let err = Args::try_parse_from(["qb-demo", "me@example.com", "pw"]).unwrap_err();
        assert_eq!(err.kind(), clap::error::ErrorKind::MissingRequiredArgument);
    }

    #[test]
    fn flags_override_defaults() {
        let args = Args::try_parse_from([
            "qb-demo",
            "--host",
            "127.0.0.1:3000",
            "--no-tls",
            "--timeout-secs",
            "5",
            "--skip-clone",
            "u",
            "p",
            "App",
        ])
        .unwrap();
        let options = args.client_options().unwrap();
        assert_eq!(options.base_url(), "http://127.0.0.1:3000");
        assert_eq!(options.timeout_secs, 5);
        assert!(options.throw_on_error);

        let scenario = args.scenario();
        assert!(!scenario.clone_app);
        assert!(scenario.create_temp_db);
        assert!(scenario.show_child_dbs);
    }

    #[test]
    fn trace_widens_the_default_filter() {
        let args = Args::try_parse_from(["qb-demo", "--trace", "u", "p", "App"]).unwrap();
        assert_eq!(args.log_filter(), "info,qb_core=trace");
        assert!(args.client_options().unwrap().trace);
    }
}
