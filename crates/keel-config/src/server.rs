//! Server configuration parsing.

use keel_core::{GitProvider, NotifierKind, Project};
use kdl::KdlDocument;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

use crate::nodes::{
    get_all_string_args, get_first_string_arg, get_integer_prop, get_string_prop, positive,
    require_bool_arg, require_positive_arg, require_string_arg,
};
use crate::project::parse_project;
use crate::{ConfigError, ConfigResult};

pub const DEFAULT_CONCURRENCY: usize = 5;
pub const DEFAULT_LISTEN: &str = "0.0.0.0:8910";
pub const DEFAULT_TIMEOUT_SECS: u64 = 3600;
pub const DEFAULT_OUTPUT_LIMIT: usize = 256 * 1024;
pub const DEFAULT_BACKLOG: usize = 100;

/// How builds are run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BuilderStrategy {
    /// A pool of `concurrency` workers.
    Threaded { concurrency: usize },
    /// One build at a time.
    Blocking,
}

impl BuilderStrategy {
    pub fn concurrency(&self) -> usize {
        match self {
            BuilderStrategy::Threaded { concurrency } => *concurrency,
            BuilderStrategy::Blocking => 1,
        }
    }
}

impl Default for BuilderStrategy {
    fn default() -> Self {
        BuilderStrategy::Threaded {
            concurrency: DEFAULT_CONCURRENCY,
        }
    }
}

/// Server-wide configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// `memory` or a sqlx SQLite URL such as `sqlite:keel.db`.
    pub database: String,
    /// Root under which per-build working directories are created.
    pub directory: PathBuf,
    /// Public URL used for links in notifications.
    pub base_url: Url,
    /// Log file; stderr when unset.
    pub log: Option<PathBuf>,
    pub listen: SocketAddr,
    /// Default policy for projects that do not set `build-all`.
    pub build_all: bool,
    pub webhook_secrets: BTreeMap<GitProvider, String>,
    /// Bearer token for the manual build API; the API is closed when unset.
    pub admin_token: Option<String>,
    pub builder: BuilderStrategy,
    pub timeout: Duration,
    /// Ceiling on captured build output, in bytes.
    pub output_limit: usize,
    /// Maximum number of queued (not yet running) builds.
    pub backlog: usize,
    pub keep_workdirs: bool,
    /// Enabled notifier channels, in dispatch order.
    pub notifiers: Vec<NotifierKind>,
    pub projects: Vec<Project>,
}

impl ServerConfig {
    /// Secret a project's webhooks must be signed with, if any.
    pub fn secret_for<'a>(&'a self, project: &'a Project) -> Option<&'a str> {
        project
            .secret
            .as_deref()
            .or_else(|| self.webhook_secrets.get(&project.provider).map(String::as_str))
    }

    pub fn project(&self, name: &str) -> Option<&Project> {
        self.projects.iter().find(|p| p.name == name)
    }
}

/// Read and parse a configuration file.
pub fn load_server_config(path: impl AsRef<Path>) -> ConfigResult<ServerConfig> {
    let text = std::fs::read_to_string(path)?;
    parse_server_config(&text)
}

/// Parse server configuration from KDL text.
pub fn parse_server_config(kdl: &str) -> ConfigResult<ServerConfig> {
    let doc: KdlDocument = kdl.parse()?;

    let mut database = None;
    let mut directory = None;
    let mut base_url = None;
    let mut log = None;
    let mut listen = None;
    let mut build_all = false;
    let mut webhook_secrets = BTreeMap::new();
    let mut admin_token = None;
    let mut builder = BuilderStrategy::default();
    let mut timeout = Duration::from_secs(DEFAULT_TIMEOUT_SECS);
    let mut output_limit = DEFAULT_OUTPUT_LIMIT;
    let mut backlog = DEFAULT_BACKLOG;
    let mut keep_workdirs = false;
    let mut notifiers = Vec::new();

    // Projects depend on the global build-all default, so parse them last
    let mut project_nodes = Vec::new();

    for node in doc.nodes() {
        match node.name().value() {
            "database" => database = Some(require_string_arg(node)?),
            "directory" => directory = Some(PathBuf::from(require_string_arg(node)?)),
            "base-url" => {
                let raw = require_string_arg(node)?;
                let url = Url::parse(&raw).map_err(|e| ConfigError::invalid("base-url", e.to_string()))?;
                base_url = Some(url);
            }
            "log" => log = Some(PathBuf::from(require_string_arg(node)?)),
            "listen" => {
                let raw = require_string_arg(node)?;
                let addr = raw
                    .parse()
                    .map_err(|_| ConfigError::invalid("listen", format!("not a socket address: {}", raw)))?;
                listen = Some(addr);
            }
            "build-all" => build_all = require_bool_arg(node)?,
            "webhook" => {
                let provider: GitProvider = require_string_arg(node)?
                    .parse()
                    .map_err(|e: String| ConfigError::invalid("webhook", e))?;
                let secret = get_string_prop(node, "secret")
                    .ok_or_else(|| ConfigError::MissingField(format!("secret for {} webhook", provider)))?;
                if webhook_secrets.insert(provider, secret).is_some() {
                    return Err(ConfigError::Duplicate(format!("{} webhook", provider)));
                }
            }
            "admin-token" => {
                let token = require_string_arg(node)?;
                if token.is_empty() {
                    return Err(ConfigError::invalid("admin-token", "must not be empty"));
                }
                admin_token = Some(token);
            }
            "builder" => builder = parse_builder(node)?,
            "timeout-secs" => timeout = Duration::from_secs(require_positive_arg(node)? as u64),
            "output-limit" => output_limit = require_positive_arg(node)?,
            "backlog" => backlog = require_positive_arg(node)?,
            "keep-workdirs" => keep_workdirs = require_bool_arg(node)?,
            "notifiers" => {
                for kind in get_all_string_args(node) {
                    let kind: NotifierKind = kind
                        .parse()
                        .map_err(|e: String| ConfigError::invalid("notifiers", e))?;
                    if notifiers.contains(&kind) {
                        return Err(ConfigError::Duplicate(format!("notifier {}", kind)));
                    }
                    notifiers.push(kind);
                }
            }
            "project" => project_nodes.push(node),
            _ => {} // Ignore unknown nodes
        }
    }

    let mut projects = Vec::with_capacity(project_nodes.len());
    let mut names = HashSet::new();
    let mut identities = HashSet::new();
    for node in project_nodes {
        let project = parse_project(node, build_all)?;
        if !names.insert(project.name.clone()) {
            return Err(ConfigError::Duplicate(format!("project '{}'", project.name)));
        }
        if !identities.insert((project.provider, project.repository.clone())) {
            return Err(ConfigError::Duplicate(format!(
                "repository {} {}",
                project.provider, project.repository
            )));
        }
        for notifier in &project.notifiers {
            if !notifiers.contains(&notifier.kind) {
                return Err(ConfigError::InvalidReference(format!(
                    "project '{}' uses notifier '{}' which is not enabled",
                    project.name, notifier.kind
                )));
            }
        }
        projects.push(project);
    }

    Ok(ServerConfig {
        database: database.ok_or_else(|| ConfigError::MissingField("database".to_string()))?,
        directory: directory.ok_or_else(|| ConfigError::MissingField("directory".to_string()))?,
        base_url: base_url.ok_or_else(|| ConfigError::MissingField("base-url".to_string()))?,
        log,
        listen: match listen {
            Some(addr) => addr,
            None => DEFAULT_LISTEN
                .parse()
                .map_err(|_| ConfigError::invalid("listen", DEFAULT_LISTEN))?,
        },
        build_all,
        webhook_secrets,
        admin_token,
        builder,
        timeout,
        output_limit,
        backlog,
        keep_workdirs,
        notifiers,
        projects,
    })
}

fn parse_builder(node: &kdl::KdlNode) -> ConfigResult<BuilderStrategy> {
    let kind = get_first_string_arg(node).unwrap_or_else(|| "threaded".to_string());
    match kind.as_str() {
        "threaded" => {
            let concurrency = match get_integer_prop(node, "concurrency") {
                Some(n) => positive("builder concurrency", n)?,
                None => DEFAULT_CONCURRENCY,
            };
            Ok(BuilderStrategy::Threaded { concurrency })
        }
        "blocking" => Ok(BuilderStrategy::Blocking),
        other => Err(ConfigError::invalid(
            "builder",
            format!("unknown builder strategy: {}", other),
        )),
    }
}
