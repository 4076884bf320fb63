//! `{{name}}` placeholder rendering over typed variable sets.
//!
//! Every template context is a struct naming exactly the placeholders it
//! offers. A placeholder the context does not define is an error, so a typo
//! or a value meant for another context can never be substituted silently.

use std::fmt;
use std::ops::Range;

pub trait TemplateVars {
    const CONTEXT: &'static str;
    const KEYS: &'static [&'static str];

    fn lookup(&self, key: &str) -> Option<&str>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TemplateError {
    Unterminated {
        context: &'static str,
        offset: usize,
    },
    Unknown {
        context: &'static str,
        name: String,
        allowed: &'static [&'static str],
    },
}

impl fmt::Display for TemplateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TemplateError::Unterminated { context, offset } => {
                write!(f, "{context} template: unterminated '{{{{' at byte {offset}")
            }
            TemplateError::Unknown {
                context,
                name,
                allowed,
            } => write!(
                f,
                "{context} template: unknown placeholder {{{{{name}}}}} (expected one of: {})",
                allowed.join(", ")
            ),
        }
    }
}

impl std::error::Error for TemplateError {}

struct Placeholder<'t> {
    span: Range<usize>,
    name: &'t str,
}

fn scan<'t>(
    context: &'static str,
    template: &'t str,
) -> Result<Vec<Placeholder<'t>>, TemplateError> {
    let mut out = Vec::new();
    let mut pos = 0;
    while let Some(rel) = template[pos..].find("{{") {
        let start = pos + rel;
        let Some(len) = template[start + 2..].find("}}") else {
            return Err(TemplateError::Unterminated {
                context,
                offset: start,
            });
        };
        let end = start + 2 + len + 2;
        out.push(Placeholder {
            span: start..end,
            name: template[start + 2..end - 2].trim(),
        });
        pos = end;
    }
    Ok(out)
}

/// Validates placeholder names against `V` without rendering.
pub fn check<V: TemplateVars>(template: &str) -> Result<(), TemplateError> {
    for p in scan(V::CONTEXT, template)? {
        if !V::KEYS.contains(&p.name) {
            return Err(unknown::<V>(p.name));
        }
    }
    Ok(())
}

pub fn render<V: TemplateVars>(template: &str, vars: &V) -> Result<String, TemplateError> {
    let mut out = String::with_capacity(template.len());
    let mut last = 0;
    for p in scan(V::CONTEXT, template)? {
        let value = vars.lookup(p.name).ok_or_else(|| unknown::<V>(p.name))?;
        out.push_str(&template[last..p.span.start]);
        out.push_str(value);
        last = p.span.end;
    }
    out.push_str(&template[last..]);
    Ok(out)
}

fn unknown<V: TemplateVars>(name: &str) -> TemplateError {
    TemplateError::Unknown {
        context: V::CONTEXT,
        name: name.to_string(),
        allowed: V::KEYS,
    }
}

/// Argv form of a rendered command line (ASCII whitespace separated, no quoting).
pub fn split_command_line(line: &str) -> Vec<String> {
    line.split_ascii_whitespace().map(str::to_string).collect()
}

/// Environment-invocation command lines (how a platform's build is launched).
#[derive(Debug, Clone)]
pub struct InvocationVars {
    pub runtime: String,
    pub cwd: String,
    pub home: String,
    pub work_dir: String,
    pub sdk_dir: String,
    pub script: String,
}

impl TemplateVars for InvocationVars {
    const CONTEXT: &'static str = "invocation";
    const KEYS: &'static [&'static str] =
        &["runtime", "cwd", "home", "work_dir", "sdk_dir", "script"];

    fn lookup(&self, key: &str) -> Option<&str> {
        match key {
            "runtime" => Some(&self.runtime),
            "cwd" => Some(&self.cwd),
            "home" => Some(&self.home),
            "work_dir" => Some(&self.work_dir),
            "sdk_dir" => Some(&self.sdk_dir),
            "script" => Some(&self.script),
            _ => None,
        }
    }
}

/// Provisioning scripts, rendered on the host and executed inside the environment.
#[derive(Debug, Clone)]
pub struct ProvisionVars {
    pub sdk: String,
    pub shared: String,
    pub toolchain_archive: String,
    pub platform: String,
}

impl TemplateVars for ProvisionVars {
    const CONTEXT: &'static str = "provision";
    const KEYS: &'static [&'static str] = &["sdk", "shared", "toolchain_archive", "platform"];

    fn lookup(&self, key: &str) -> Option<&str> {
        match key {
            "sdk" => Some(&self.sdk),
            "shared" => Some(&self.shared),
            "toolchain_archive" => Some(&self.toolchain_archive),
            "platform" => Some(&self.platform),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PayloadVars {
    pub marker: String,
}

impl TemplateVars for PayloadVars {
    const CONTEXT: &'static str = "payload";
    const KEYS: &'static [&'static str] = &["marker"];

    fn lookup(&self, key: &str) -> Option<&str> {
        match key {
            "marker" => Some(&self.marker),
            _ => None,
        }
    }
}

/// Environment redirection values. `root` is the working directory as seen by
/// the process being configured (host path or guest mount point).
#[derive(Debug, Clone)]
pub struct IsolationVars {
    pub root: String,
    pub case: String,
}

impl TemplateVars for IsolationVars {
    const CONTEXT: &'static str = "isolation";
    const KEYS: &'static [&'static str] = &["root", "case"];

    fn lookup(&self, key: &str) -> Option<&str> {
        match key {
            "root" => Some(&self.root),
            "case" => Some(&self.case),
            _ => None,
        }
    }
}

/// Custom test-case commands; the phase number is appended as the last argument.
#[derive(Debug, Clone)]
pub struct CaseVars {
    pub work_dir: String,
    pub env: String,
    pub runs_on: String,
    pub built_by: String,
}

impl TemplateVars for CaseVars {
    const CONTEXT: &'static str = "case command";
    const KEYS: &'static [&'static str] = &["work_dir", "env", "runs_on", "built_by"];

    fn lookup(&self, key: &str) -> Option<&str> {
        match key {
            "work_dir" => Some(&self.work_dir),
            "env" => Some(&self.env),
            "runs_on" => Some(&self.runs_on),
            "built_by" => Some(&self.built_by),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn provision_vars() -> ProvisionVars {
        ProvisionVars {
            sdk: "/sdk".to_string(),
            shared: "/tmp2".to_string(),
            toolchain_archive: "go1.19.3.linux-arm64.tar.gz".to_string(),
            platform: "linux-arm64-ubuntu".to_string(),
        }
    }

    #[test]
    fn renders_named_placeholders() {
        let got = render(
            "tar xf {{sdk}}/setup/{{ toolchain_archive }}\ncp gorun {{shared}}/built-by-{{platform}}",
            &provision_vars(),
        )
        .unwrap();
        assert_eq!(
            got,
            "tar xf /sdk/setup/go1.19.3.linux-arm64.tar.gz\ncp gorun /tmp2/built-by-linux-arm64-ubuntu"
        );
    }

    #[test]
    fn shell_syntax_passes_through() {
        let t = "cp2 ()\n{\n    mkdir -p \"$2\"\n}\nPATH=~/go/bin:$PATH ${HOME}";
        assert_eq!(render(t, &provision_vars()).unwrap(), t);
    }

    #[test]
    fn unknown_placeholder_is_rejected() {
        let err = render("{{platforms}}", &provision_vars()).unwrap_err();
        assert!(matches!(&err, TemplateError::Unknown { name, .. } if name == "platforms"));
        assert!(err.to_string().contains("provision template"), "{err}");

        // A key from a different context is not available here.
        assert!(check::<PayloadVars>("{{platform}}").is_err());
        check::<ProvisionVars>("{{platform}}").unwrap();
    }

    #[test]
    fn unterminated_placeholder_is_rejected() {
        let err = check::<PayloadVars>("fmt.Println(\"{{marker\")").unwrap_err();
        assert_eq!(
            err,
            TemplateError::Unterminated {
                context: "payload",
                offset: 13
            }
        );
    }

    #[test]
    fn substituted_values_are_not_rescanned() {
        let vars = PayloadVars {
            marker: "{{marker}}".to_string(),
        };
        assert_eq!(render("a {{marker}} b", &vars).unwrap(), "a {{marker}} b");
    }

    #[test]
    fn split_command_line_on_whitespace() {
        assert_eq!(
            split_command_line("  podman run\t-v /a:/b   img /tmp2/x \n"),
            vec!["podman", "run", "-v", "/a:/b", "img", "/tmp2/x"]
        );
        assert!(split_command_line("   ").is_empty());
    }
}
