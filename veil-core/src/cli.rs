//! Command Line Parsing
//!
//! Turns the process argument vector into a [`Configuration`]. Option parsing
//! stops at the first positional argument: that argument names the script and
//! everything after it, hyphenated or not, belongs to the script.

use crate::config::{
    Configuration, DeprecationPolicy, InputType, ScriptOp, ScriptSource, SpecifierResolution,
};
use clap::error::ErrorKind;
use clap::{Arg, ArgAction, ArgMatches, Command};
use std::ffi::OsString;
use thiserror::Error;

/// Exit code for configuration errors.
pub const CONFIG_ERROR_EXIT_CODE: i32 = 1;

const ENVIRONMENT_HELP: &str = "\
Environment variables:
  UV_THREADPOOL_SIZE    sets the number of threads used for blocking work
  VEIL_LOG              log filter directives (default: warn)";

#[derive(Debug, Error)]
pub enum CliError {
    #[error(transparent)]
    Clap(#[from] clap::Error),
    #[error("veil: no filename specified")]
    MissingScript,
}

impl CliError {
    /// Process exit code for this outcome. Help and version requests exit cleanly.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Clap(err)
                if matches!(
                    err.kind(),
                    ErrorKind::DisplayHelp | ErrorKind::DisplayVersion
                ) =>
            {
                0
            }
            _ => CONFIG_ERROR_EXIT_CODE,
        }
    }

    /// Print the message to the stream clap would use (stdout for help/version).
    pub fn report(&self) {
        match self {
            Self::Clap(err) => {
                let _ = err.print();
            }
            Self::MissingScript => eprintln!("{self}"),
        }
    }
}

/// Result of handing argv to the parser.
#[derive(Debug)]
pub enum ParseOutcome {
    /// Start the runtime with this configuration.
    Run(Configuration),
    /// Exit immediately with this code; the runtime is never started.
    Exit(i32),
}

fn command() -> Command {
    Command::new("veil")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Script runtime host")
        .override_usage("veil [options] [script.js] [arguments]")
        .disable_version_flag(true)
        .after_help(ENVIRONMENT_HELP)
        .arg(
            Arg::new("version")
                .short('v')
                .long("version")
                .action(ArgAction::Version)
                .help("print veil version"),
        )
        .arg(
            Arg::new("eval")
                .short('e')
                .long("eval")
                .value_name("SCRIPT")
                .allow_hyphen_values(true)
                .action(ArgAction::Set)
                .help("evaluate script"),
        )
        .arg(
            Arg::new("print")
                .short('p')
                .long("print")
                .value_name("SCRIPT")
                .allow_hyphen_values(true)
                .action(ArgAction::Set)
                .help("evaluate script and print result"),
        )
        .arg(flag("expose-gc", "expose gc() function in global namespace"))
        .arg(flag("no-deprecation", "silence deprecation warnings"))
        .arg(flag("throw-deprecation", "throw an exception on deprecations"))
        .arg(flag("expose-internals", "enable importing of internal builtin modules"))
        .arg(flag("preserve-symlinks", "preserve symbolic links when resolving"))
        .arg(flag(
            "preserve-symlinks-main",
            "preserve symbolic links when resolving the main module",
        ))
        .arg(
            Arg::new("loader")
                .long("loader")
                .value_name("MODULE")
                .allow_hyphen_values(true)
                .action(ArgAction::Set)
                .help("use the specified module as a custom loader"),
        )
        .arg(
            Arg::new("conditions")
                .short('C')
                .long("conditions")
                .value_name("CONDITION")
                .allow_hyphen_values(true)
                .action(ArgAction::Append)
                .help("additional user conditions for conditional exports and imports"),
        )
        .arg(
            Arg::new("require")
                .short('r')
                .long("require")
                .value_name("MODULE")
                .allow_hyphen_values(true)
                .action(ArgAction::Append)
                .help("CJS module to preload (option can be repeated)"),
        )
        .arg(
            Arg::new("import")
                .long("import")
                .value_name("MODULE")
                .allow_hyphen_values(true)
                .action(ArgAction::Append)
                .help("ES module to preload (option can be repeated)"),
        )
        .arg(
            Arg::new("input-type")
                .long("input-type")
                .value_name("TYPE")
                .value_parser(["module", "commonjs"])
                .action(ArgAction::Set)
                .help("set module type for string input"),
        )
        .arg(
            Arg::new("es-module-specifier-resolution")
                .long("es-module-specifier-resolution")
                .value_name("MODE")
                .value_parser(["node", "explicit"])
                .action(ArgAction::Set)
                .help("select extension resolution algorithm for es modules"),
        )
        .arg(
            Arg::new("args")
                .value_name("SCRIPT_AND_ARGS")
                .num_args(1..)
                .trailing_var_arg(true)
                .action(ArgAction::Append),
        )
}

fn flag(name: &'static str, help: &'static str) -> Arg {
    Arg::new(name).long(name).action(ArgAction::SetTrue).help(help)
}

/// Parse argv (including argv0) into a [`Configuration`].
pub fn parse_configuration<I, T>(args: I) -> Result<Configuration, CliError>
where
    I: IntoIterator<Item = T>,
    T: Into<OsString>,
{
    let raw: Vec<String> = args
        .into_iter()
        .map(|arg| arg.into().to_string_lossy().into_owned())
        .collect();
    let matches = command().try_get_matches_from(&raw)?;

    let trailing: Vec<String> = matches
        .get_many::<String>("args")
        .map(|values| values.cloned().collect())
        .unwrap_or_default();

    let mut config = Configuration {
        deprecation: deprecation_policy(&matches),
        expose_gc: matches.get_flag("expose-gc"),
        expose_internals: matches.get_flag("expose-internals"),
        preserve_symlinks: matches.get_flag("preserve-symlinks"),
        preserve_symlinks_main: matches.get_flag("preserve-symlinks-main"),
        loader: matches.get_one::<String>("loader").cloned(),
        input_type: matches
            .get_one::<String>("input-type")
            .and_then(|value| InputType::parse(value))
            .unwrap_or_default(),
        specifier_resolution: matches
            .get_one::<String>("es-module-specifier-resolution")
            .and_then(|value| SpecifierResolution::parse(value))
            .unwrap_or_default(),
        require: strings(&matches, "require"),
        import: strings(&matches, "import"),
        conditions: strings(&matches, "conditions"),
        argv0: raw.first().cloned().unwrap_or_default(),
        exec_argv: raw
            .get(1..raw.len() - trailing.len())
            .map(<[String]>::to_vec)
            .unwrap_or_default(),
        ..Configuration::default()
    };

    let mut trailing = trailing.into_iter();
    config.script = match inline_script(&matches) {
        Some(script) => script,
        None => ScriptSource {
            op: ScriptOp::Specifier,
            source: trailing.next().ok_or(CliError::MissingScript)?,
        },
    };
    config.argv = trailing.collect();

    Ok(config)
}

/// Parse argv, printing help, version or errors as a side effect.
pub fn parse_args<I, T>(args: I) -> ParseOutcome
where
    I: IntoIterator<Item = T>,
    T: Into<OsString>,
{
    match parse_configuration(args) {
        Ok(config) => ParseOutcome::Run(config),
        Err(err) => {
            err.report();
            ParseOutcome::Exit(err.exit_code())
        }
    }
}

fn deprecation_policy(matches: &ArgMatches) -> DeprecationPolicy {
    if matches.get_flag("throw-deprecation") {
        DeprecationPolicy::Throw
    } else if matches.get_flag("no-deprecation") {
        DeprecationPolicy::Silence
    } else {
        DeprecationPolicy::Warn
    }
}

/// `--eval` / `--print` source; the one given last wins.
fn inline_script(matches: &ArgMatches) -> Option<ScriptSource> {
    let eval = matches
        .get_one::<String>("eval")
        .map(|source| (matches.index_of("eval"), ScriptOp::Eval, source));
    let print = matches
        .get_one::<String>("print")
        .map(|source| (matches.index_of("print"), ScriptOp::Print, source));

    let (_, op, source) = match (eval, print) {
        (Some(e), Some(p)) => {
            if p.0 > e.0 {
                p
            } else {
                e
            }
        }
        (Some(e), None) => e,
        (None, Some(p)) => p,
        (None, None) => return None,
    };

    Some(ScriptSource {
        op,
        source: source.clone(),
    })
}

fn strings(matches: &ArgMatches, id: &str) -> Vec<String> {
    matches
        .get_many::<String>(id)
        .map(|values| values.cloned().collect())
        .unwrap_or_default()
}
