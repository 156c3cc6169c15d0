//! Command-line surface of the `proxymon` binary.
//!
//! Configuration flags are routed to `ortho_config` while the verb flags are
//! parsed by [`Cli`]. The historical single-dash spellings (`-start`, `-stop`,
//! `-quit`, and their `-start=false` forms) are accepted and normalised to
//! their long forms. A verb flag takes an optional boolish value, so
//! `--quit=0` leaves the verb unset.

use std::ffi::{OsStr, OsString};

use clap::builder::BoolishValueParser;
use clap::{ArgAction, Parser};

use crate::action::Action;

/// Flags consumed by the configuration loader rather than [`Cli`].
pub(crate) const CONFIG_CLI_FLAGS: &[&str] = &[
    "--config-path",
    "--instance-name",
    "--namespace-dir",
    "--journal-path",
    "--settings-path",
    "--tray-icon",
    "--log-filter",
    "--log-format",
];

const LEGACY_VERBS: &[(&str, &str)] = &[
    ("-start", "--start"),
    ("-stop", "--stop"),
    ("-quit", "--quit"),
];

/// Verb flags understood by the binary.
#[derive(Parser, Debug, Default, Clone, Copy, PartialEq, Eq)]
#[command(
    name = "proxymon",
    version,
    about = "Journals changes to the per-user proxy settings.",
    args_override_self = true
)]
pub struct Cli {
    /// Turn proxy logging on in the running instance.
    #[arg(
        long,
        action = ArgAction::Set,
        num_args = 0..=1,
        require_equals = true,
        default_value_t = false,
        default_missing_value = "true",
        value_parser = BoolishValueParser::new()
    )]
    pub start: bool,
    /// Turn proxy logging off in the running instance.
    #[arg(
        long,
        action = ArgAction::Set,
        num_args = 0..=1,
        require_equals = true,
        default_value_t = false,
        default_missing_value = "true",
        value_parser = BoolishValueParser::new()
    )]
    pub stop: bool,
    /// Shut the running instance down.
    #[arg(
        long,
        action = ArgAction::Set,
        num_args = 0..=1,
        require_equals = true,
        default_value_t = false,
        default_missing_value = "true",
        value_parser = BoolishValueParser::new()
    )]
    pub quit: bool,
}

impl Cli {
    /// Resolves the flags to one verb by precedence `quit > stop > start`.
    #[must_use]
    pub const fn action(&self) -> Action {
        Action::from_flags(self.start, self.stop, self.quit)
    }
}

/// Process arguments partitioned between the two parsers.
///
/// Both vectors start with the program name so each can be handed to its
/// parser unchanged.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CliArguments {
    /// Arguments for `ortho_config`.
    pub config: Vec<OsString>,
    /// Arguments for [`Cli`].
    pub command: Vec<OsString>,
}

#[derive(Debug, Clone, Copy)]
enum FlagAction {
    Include { needs_value: bool },
    Skip,
}

fn classify(argument: &OsStr) -> FlagAction {
    let text = argument.to_string_lossy();
    if !text.starts_with("--") {
        return FlagAction::Skip;
    }
    let mut parts = text.splitn(2, '=');
    let flag = parts.next().unwrap_or_default();
    let has_inline_value = parts.next().is_some();
    if CONFIG_CLI_FLAGS.contains(&flag) {
        FlagAction::Include {
            needs_value: !has_inline_value,
        }
    } else {
        FlagAction::Skip
    }
}

fn normalise(argument: OsString) -> OsString {
    let replacement = argument.to_str().and_then(|text| {
        let (flag, value) = text
            .split_once('=')
            .map_or((text, None), |(flag, value)| (flag, Some(value)));
        LEGACY_VERBS
            .iter()
            .find(|(legacy, _)| *legacy == flag)
            .map(|(_, long)| match value {
                Some(value) => format!("{long}={value}"),
                None => (*long).to_owned(),
            })
    });
    replacement.map_or(argument, OsString::from)
}

/// Splits process arguments between the configuration loader and [`Cli`].
pub fn split_arguments<I, T>(args: I) -> CliArguments
where
    I: IntoIterator<Item = T>,
    T: Into<OsString>,
{
    let mut arguments = args.into_iter().map(Into::into);
    let program = arguments
        .next()
        .unwrap_or_else(|| OsString::from("proxymon"));
    let mut split = CliArguments {
        config: vec![program.clone()],
        command: vec![program],
    };

    let mut pending_value = false;
    for argument in arguments {
        if pending_value {
            split.config.push(argument);
            pending_value = false;
            continue;
        }
        match classify(&argument) {
            FlagAction::Include { needs_value } => {
                split.config.push(argument);
                pending_value = needs_value;
            }
            FlagAction::Skip => split.command.push(normalise(argument)),
        }
    }
    split
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn os(values: &[&str]) -> Vec<OsString> {
        values.iter().map(OsString::from).collect()
    }

    #[rstest]
    #[case(&["proxymon"], Action::None)]
    #[case(&["proxymon", "-start"], Action::Start)]
    #[case(&["proxymon", "--stop"], Action::Stop)]
    #[case(&["proxymon", "-start", "-stop"], Action::Stop)]
    #[case(&["proxymon", "-stop", "-quit", "-start"], Action::Quit)]
    #[case(&["proxymon", "-start=true"], Action::Start)]
    #[case(&["proxymon", "-quit=false", "-stop"], Action::Stop)]
    #[case(&["proxymon", "-stop=0"], Action::None)]
    #[case(&["proxymon", "--quit=1"], Action::Quit)]
    #[case(&["proxymon", "-start", "-start=false"], Action::None)]
    fn verbs_resolve_by_precedence(#[case] args: &[&str], #[case] expected: Action) {
        let split = split_arguments(args.iter().copied());
        let cli = Cli::try_parse_from(&split.command).expect("verbs parse");
        assert_eq!(cli.action(), expected);
    }

    #[test]
    fn configuration_flags_are_routed_to_the_loader() {
        let split = split_arguments([
            "proxymon",
            "--log-filter",
            "debug",
            "-stop",
            "--instance-name=lab",
            "--namespace-dir",
            "/run/ns",
        ]);

        assert_eq!(
            split.config,
            os(&[
                "proxymon",
                "--log-filter",
                "debug",
                "--instance-name=lab",
                "--namespace-dir",
                "/run/ns",
            ])
        );
        assert_eq!(split.command, os(&["proxymon", "--stop"]));
    }

    #[test]
    fn legacy_verbs_keep_their_inline_values() {
        let split = split_arguments(["proxymon", "-start=false", "-quit", "-stop=1"]);
        assert_eq!(
            split.command,
            os(&["proxymon", "--start=false", "--quit", "--stop=1"])
        );
    }

    #[test]
    fn verb_values_must_be_boolish() {
        let split = split_arguments(["proxymon", "-start=maybe"]);
        assert!(Cli::try_parse_from(&split.command).is_err());
    }

    #[test]
    fn unknown_flags_reach_the_verb_parser() {
        let split = split_arguments(["proxymon", "--bogus"]);
        assert!(Cli::try_parse_from(&split.command).is_err());
    }

    #[test]
    fn empty_argument_lists_get_a_program_name() {
        let split = split_arguments(Vec::<OsString>::new());
        assert_eq!(split.config, os(&["proxymon"]));
        assert_eq!(split.command, os(&["proxymon"]));
    }
}
