use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::Path;

use anyhow::{Context, Result};
use crossmatrix_contracts::MATRIX_CONFIG_SCHEMA_VERSION;
use crossmatrix_vm::VmBackend;
use serde::{Deserialize, Serialize};

use crate::template::{
    self, CaseVars, InvocationVars, IsolationVars, PayloadVars, ProvisionVars, TemplateVars,
};

pub const DEFAULT_PROVISION_MS: u64 = 60 * 60 * 1000;
pub const DEFAULT_CASE_MS: u64 = 15 * 60 * 1000;

/// The whole build/run matrix: images, platforms, run targets and test cases.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MatrixConfig {
    pub schema_version: String,
    /// Platform tag of the one supported native development host.
    pub host: String,
    pub backend: VmBackend,
    #[serde(default)]
    pub timeouts: Timeouts,
    pub images: Vec<EnvironmentImage>,
    pub platforms: Vec<Platform>,
    pub targets: Vec<Target>,
    pub tool: ToolSpec,
    pub payloads: Payloads,
    pub host_isolation: Isolation,
    pub container_isolation: Isolation,
    pub cases: Vec<TestCase>,
}

/// `None` means wait without limit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Timeouts {
    pub provision_ms: Option<u64>,
    pub case_ms: Option<u64>,
}

impl Default for Timeouts {
    fn default() -> Self {
        Timeouts {
            provision_ms: Some(DEFAULT_PROVISION_MS),
            case_ms: Some(DEFAULT_CASE_MS),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EnvironmentImage {
    pub tag: String,
    /// Dockerfile body.
    pub build_script: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Platform {
    pub tag: String,
    /// Command line launching the isolated build; rendered with [`InvocationVars`].
    pub invocation: String,
    pub toolchain_archive: String,
    /// Shell script run inside the environment; rendered with [`ProvisionVars`].
    pub provision_script: String,
    /// Run targets this platform's build leaves an artifact for.
    pub produces: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Target {
    pub tag: String,
    /// Environment selecting this target when cross-compiling.
    #[serde(default)]
    pub cross_env: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ToolSpec {
    /// File name of the tool inside each artifact location.
    pub exe: String,
    /// Arguments placed before the payload when cross-compiling.
    pub cross_args: Vec<String>,
    pub locate: ProgramLocator,
    /// File name the cross-built program is staged under.
    pub program: String,
}

/// Finds the built program in the tool's cross-compile output: the first line
/// containing `line_marker`, its space-separated field `field` (0-based) is a
/// path, and the program is `file_name` next to it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProgramLocator {
    pub line_marker: String,
    pub field: usize,
    pub file_name: String,
}

impl ProgramLocator {
    pub fn locate(&self, output: &str) -> Option<std::path::PathBuf> {
        let line = output.lines().find(|l| l.contains(&self.line_marker))?;
        let reported = line.split(' ').nth(self.field)?;
        if reported.is_empty() {
            return None;
        }
        let dir = Path::new(reported).parent()?;
        Some(dir.join(&self.file_name))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Payloads {
    /// Source text; rendered with [`PayloadVars`].
    pub body: String,
    /// Run directly by the tool in phase 1.
    pub first: Payload,
    /// Cross-compiled for every other target in phase 1.
    pub second: Payload,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Payload {
    pub file: String,
    pub marker: String,
}

/// Environment redirection applied to verification runs.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Isolation {
    /// Rendered with [`IsolationVars`], `root` being the working directory as
    /// seen by the process.
    pub env: BTreeMap<String, String>,
    /// Rendered with [`IsolationVars`] against the host working directory and
    /// created before the run.
    pub create_dirs: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnvSelector {
    /// No isolation: run directly on the host.
    Host,
    /// Run inside this image.
    Image(String),
}

impl fmt::Display for EnvSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EnvSelector::Host => f.write_str("host"),
            EnvSelector::Image(image) => f.write_str(image),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TestCase {
    pub env: EnvSelector,
    pub runs_on: String,
    pub built_by: String,
    /// Replaces the built-in two-phase protocol; rendered with [`CaseVars`].
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
}

impl TestCase {
    pub fn label(&self) -> String {
        format!(
            "env={} runs-on={} built-by={}",
            self.env, self.runs_on, self.built_by
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigError {
    pub problems: Vec<String>,
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid matrix config:")?;
        for p in &self.problems {
            write!(f, "\n  - {p}")?;
        }
        Ok(())
    }
}

impl std::error::Error for ConfigError {}

const GO_PAYLOAD: &str = r#"#! /usr/bin/env gorun

package main

import "fmt"

func main() {
   fmt.Println("standalone go code - {{marker}}")
}
"#;

const UBUNTU_ARM64_DOCKERFILE: &str = r#"FROM docker.io/arm64v8/ubuntu
RUN apt-get update && \
  apt-get install -y ca-certificates && \
  update-ca-certificates
"#;

const LINUX_ARM64_PROVISION: &str = r#"#! /bin/sh
set -eu
cd
tar xf {{sdk}}/setup/{{toolchain_archive}}
PATH=~/go/bin:$PATH
CGO_ENABLED=0 go install github.com/bir3/gorun@v0.1.4
cp2 ()
{
    mkdir -p "$2"
    cp "$1" "$2"
}
cp2 ~/go/bin/gorun {{shared}}/runs-on-linux-arm64/built-by-{{platform}}/

GOOS=darwin GOARCH=arm64 go install github.com/bir3/gorun@v0.1.4
cp2 ~/go/bin/darwin_arm64/gorun {{shared}}/runs-on-darwin-arm64/built-by-{{platform}}/
"#;

fn s(v: &str) -> String {
    v.to_string()
}

fn env_map(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
    pairs.iter().map(|(k, v)| (s(k), s(v))).collect()
}

impl MatrixConfig {
    /// The known platform set: a macOS arm64 host, and an Ubuntu arm64 builder
    /// whose artifacts are verified on Ubuntu, Alpine and the host itself.
    pub fn builtin() -> Self {
        MatrixConfig {
            schema_version: s(MATRIX_CONFIG_SCHEMA_VERSION),
            host: s("darwin-arm64"),
            backend: VmBackend::Podman,
            timeouts: Timeouts::default(),
            images: vec![EnvironmentImage {
                tag: s("arm64-ubuntu"),
                build_script: s(UBUNTU_ARM64_DOCKERFILE),
            }],
            platforms: vec![Platform {
                tag: s("linux-arm64-ubuntu"),
                invocation: s("{{runtime}} run --rm -v {{work_dir}}:/tmp2 -v {{sdk_dir}}:/sdk/setup:ro arm64-ubuntu /tmp2/{{script}}"),
                toolchain_archive: s("go1.19.3.linux-arm64.tar.gz"),
                provision_script: s(LINUX_ARM64_PROVISION),
                produces: vec![s("linux-arm64"), s("darwin-arm64")],
            }],
            targets: vec![
                Target {
                    tag: s("linux-arm64"),
                    cross_env: env_map(&[("GOOS", "linux"), ("GOARCH", "arm64")]),
                },
                Target {
                    tag: s("darwin-arm64"),
                    cross_env: env_map(&[("GOOS", "darwin"), ("GOARCH", "arm64")]),
                },
            ],
            tool: ToolSpec {
                exe: s("gorun"),
                cross_args: vec![s("-show")],
                locate: ProgramLocator {
                    line_marker: s("->"),
                    field: 2,
                    file_name: s("main"),
                },
                program: s("goscript"),
            },
            payloads: Payloads {
                body: s(GO_PAYLOAD),
                first: Payload {
                    file: s("goscript-blue"),
                    marker: s("blue"),
                },
                second: Payload {
                    file: s("goscript-green"),
                    marker: s("green"),
                },
            },
            // The tool has no option to move its cache, so HOME is redirected.
            host_isolation: Isolation {
                env: env_map(&[
                    ("HOME", "{{root}}/gorun-cache"),
                    ("GOCACHE", "{{root}}/gocache"),
                    ("GOMODCACHE", "{{root}}/gomodcache"),
                ]),
                create_dirs: vec![s("{{root}}/gorun-cache/Library/Caches")],
            },
            container_isolation: Isolation {
                env: env_map(&[("HOME", "{{root}}/home/{{case}}")]),
                create_dirs: vec![s("{{root}}/home/{{case}}")],
            },
            cases: vec![
                TestCase {
                    env: EnvSelector::Image(s("docker.io/arm64v8/ubuntu")),
                    runs_on: s("linux-arm64"),
                    built_by: s("linux-arm64-ubuntu"),
                    command: None,
                },
                TestCase {
                    env: EnvSelector::Image(s("docker.io/arm64v8/alpine:3.16")),
                    runs_on: s("linux-arm64"),
                    built_by: s("linux-arm64-ubuntu"),
                    command: None,
                },
                TestCase {
                    env: EnvSelector::Host,
                    runs_on: s("darwin-arm64"),
                    built_by: s("linux-arm64-ubuntu"),
                    command: None,
                },
            ],
        }
    }

    pub fn load(path: &Path) -> Result<Self> {
        let bytes = std::fs::read(path)
            .with_context(|| format!("read matrix config: {}", path.display()))?;
        let cfg: MatrixConfig = serde_json::from_slice(&bytes)
            .with_context(|| format!("parse matrix config JSON: {}", path.display()))?;
        cfg.validate()
            .with_context(|| format!("validate matrix config: {}", path.display()))?;
        Ok(cfg)
    }

    pub fn to_json_pretty(&self) -> Result<Vec<u8>> {
        let mut bytes = serde_json::to_vec_pretty(self)?;
        bytes.push(b'\n');
        Ok(bytes)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut problems: Vec<String> = Vec::new();

        if self.schema_version != MATRIX_CONFIG_SCHEMA_VERSION {
            problems.push(format!(
                "schema_version mismatch: expected {MATRIX_CONFIG_SCHEMA_VERSION} got {:?}",
                self.schema_version
            ));
        }

        check_tag(&mut problems, "host", &self.host);

        unique_tags(
            &mut problems,
            "image",
            self.images.iter().map(|i| i.tag.as_str()),
        );
        let platform_tags = unique_tags(
            &mut problems,
            "platform",
            self.platforms.iter().map(|p| p.tag.as_str()),
        );
        let target_tags = unique_tags(
            &mut problems,
            "target",
            self.targets.iter().map(|t| t.tag.as_str()),
        );

        for p in &self.platforms {
            check_template::<InvocationVars>(&mut problems, &p.tag, &p.invocation);
            check_template::<ProvisionVars>(&mut problems, &p.tag, &p.provision_script);
            if p.produces.is_empty() {
                problems.push(format!("platform {}: produces is empty", p.tag));
            }
            for t in &p.produces {
                if !target_tags.contains(t.as_str()) {
                    problems.push(format!("platform {}: produces unknown target {t:?}", p.tag));
                }
            }
        }

        for (what, v) in [
            ("tool.exe", &self.tool.exe),
            ("tool.program", &self.tool.program),
            ("tool.locate.file_name", &self.tool.locate.file_name),
            ("payloads.first.file", &self.payloads.first.file),
            ("payloads.second.file", &self.payloads.second.file),
        ] {
            check_file_name(&mut problems, what, v);
        }
        if self.tool.locate.line_marker.is_empty() {
            problems.push("tool.locate.line_marker is empty".to_string());
        }
        if self.payloads.first.marker.is_empty() || self.payloads.second.marker.is_empty() {
            problems.push("payload markers must be non-empty".to_string());
        }
        check_template::<PayloadVars>(&mut problems, "payloads", &self.payloads.body);

        for (what, iso) in [
            ("host_isolation", &self.host_isolation),
            ("container_isolation", &self.container_isolation),
        ] {
            for v in iso.env.values().chain(iso.create_dirs.iter()) {
                check_template::<IsolationVars>(&mut problems, what, v);
            }
        }

        if self.cases.is_empty() {
            problems.push("cases is empty".to_string());
        }
        for (i, c) in self.cases.iter().enumerate() {
            let n = i + 1;
            if !platform_tags.contains(c.built_by.as_str()) {
                problems.push(format!(
                    "case {n}: built_by names unknown platform {:?}",
                    c.built_by
                ));
            }
            if !target_tags.contains(c.runs_on.as_str()) {
                problems.push(format!("case {n}: runs_on names unknown target {:?}", c.runs_on));
            }
            let on_host = c.runs_on == self.host;
            match (&c.env, on_host) {
                (EnvSelector::Host, false) => problems.push(format!(
                    "case {n}: env host requires runs_on == host ({:?})",
                    self.host
                )),
                (EnvSelector::Image(_), true) => problems.push(format!(
                    "case {n}: runs_on {:?} is the host platform; use env \"host\"",
                    c.runs_on
                )),
                (EnvSelector::Image(image), false) if image.trim().is_empty() => {
                    problems.push(format!("case {n}: image is empty"))
                }
                _ => {}
            }
            if let Some(cmd) = &c.command {
                check_template::<CaseVars>(&mut problems, &format!("case {n}"), cmd);
            }
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(ConfigError { problems })
        }
    }
}

fn is_tag_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-')
}

fn check_tag(problems: &mut Vec<String>, what: &str, tag: &str) {
    if tag.is_empty() {
        problems.push(format!("{what} tag is empty"));
    } else if !tag.chars().all(is_tag_char) || tag.starts_with('.') {
        problems.push(format!(
            "{what} tag {tag:?} must match [A-Za-z0-9._-]+ and not start with '.'"
        ));
    }
}

fn check_file_name(problems: &mut Vec<String>, what: &str, name: &str) {
    if name.is_empty() || name.contains('/') || name == "." || name == ".." {
        problems.push(format!("{what} must be a plain file name (got {name:?})"));
    }
}

fn unique_tags<'a>(
    problems: &mut Vec<String>,
    what: &str,
    tags: impl Iterator<Item = &'a str>,
) -> BTreeSet<&'a str> {
    let mut seen = BTreeSet::new();
    for tag in tags {
        check_tag(problems, what, tag);
        if !seen.insert(tag) {
            problems.push(format!("duplicate {what} tag {tag:?}"));
        }
    }
    seen
}

fn check_template<V: TemplateVars>(problems: &mut Vec<String>, owner: &str, t: &str) {
    if let Err(err) = template::check::<V>(t) {
        problems.push(format!("{owner}: {err}"));
    }
}
