//! Project definitions.

use keel_core::{BuildPolicy, GitProvider, NotifierConfig, NotifierKind, NotifierSettings, Project};
use kdl::KdlNode;

use crate::nodes::{
    get_all_string_args, get_bool_prop, get_first_string_arg, require_bool_arg, require_string_arg,
};
use crate::{ConfigError, ConfigResult};

/// Parse a `project "name" { ... }` node.
///
/// `default_build_all` is the server-wide policy, used when the project does
/// not set `build-all` itself.
pub fn parse_project(node: &KdlNode, default_build_all: bool) -> ConfigResult<Project> {
    let name = get_first_string_arg(node)
        .ok_or_else(|| ConfigError::MissingField("project name".to_string()))?;

    let mut provider = GitProvider::Github;
    let mut repository = None;
    let mut clone_url = None;
    let mut command = None;
    let mut branches = Vec::new();
    let mut build_all = default_build_all;
    let mut secret = None;
    let mut notifiers = Vec::new();

    if let Some(children) = node.children() {
        for child in children.nodes() {
            match child.name().value() {
                "provider" => {
                    let value = require_string_arg(child)?;
                    provider = value
                        .parse()
                        .map_err(|e: String| ConfigError::invalid("provider", e))?;
                }
                "repository" => repository = Some(require_string_arg(child)?),
                "clone-url" => clone_url = Some(require_string_arg(child)?),
                "command" => command = Some(require_string_arg(child)?),
                "branches" => branches = get_all_string_args(child),
                "build-all" => build_all = require_bool_arg(child)?,
                "secret" => secret = Some(require_string_arg(child)?),
                "notifier" => notifiers.push(parse_notifier(child)?),
                _ => {} // Ignore unknown nodes
            }
        }
    }

    let repository = repository
        .ok_or_else(|| ConfigError::MissingField(format!("repository for project '{}'", name)))?;
    let command = command
        .filter(|c| !c.trim().is_empty())
        .ok_or_else(|| ConfigError::MissingField(format!("command for project '{}'", name)))?;
    let clone_url = clone_url.unwrap_or_else(|| default_clone_url(provider, &repository));

    Ok(Project {
        name,
        provider,
        repository,
        clone_url,
        command,
        branches,
        policy: if build_all {
            BuildPolicy::BuildAll
        } else {
            BuildPolicy::HeadOnly
        },
        secret,
        notifiers,
    })
}

fn parse_notifier(node: &KdlNode) -> ConfigResult<NotifierConfig> {
    let kind: NotifierKind = require_string_arg(node)?
        .parse()
        .map_err(|e: String| ConfigError::invalid("notifier", e))?;
    let on_change_only = get_bool_prop(node, "on-change-only").unwrap_or(false);

    let mut settings = NotifierSettings::new();
    if let Some(children) = node.children() {
        for child in children.nodes() {
            let key = child.name().value().to_string();
            if let Some(val) = get_first_string_arg(child) {
                settings.insert(key, val);
            }
        }
    }

    Ok(NotifierConfig {
        kind,
        settings,
        on_change_only,
    })
}

fn default_clone_url(provider: GitProvider, repository: &str) -> String {
    match provider {
        GitProvider::Github => format!("https://github.com/{}.git", repository),
        GitProvider::Gitlab => format!("https://gitlab.com/{}.git", repository),
    }
}
