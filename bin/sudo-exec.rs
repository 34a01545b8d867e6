use std::{
    ffi::OsString,
    os::unix::{ffi::OsStrExt, fs::PermissionsExt},
    path::{Path, PathBuf},
    time::Duration,
};

use sudo_exec::{
    run_command, CommandDetails, CommandStatus, Error, ExecFlags, ExitReason, Plugin, Plugins,
    PolicyDecision, PolicyPlugin, SudoLogger,
};

const USAGE_MSG: &str =
    "usage: sudo-exec [-P] [-b] [-T secs] [-i] [-I] [-N] [-D dir] -- command [args...]";

#[derive(Debug, Default, PartialEq)]
struct ExecOptions {
    use_pty: bool,
    background: bool,
    timeout: Option<Duration>,
    intercept: bool,
    log_subcmds: bool,
    noexec: bool,
    directory: Option<PathBuf>,
    command: Vec<OsString>,
}

impl ExecOptions {
    const TAKES_ARGUMENT_SHORT: &'static [char] = &['T', 'D'];

    /// parse an iterator over command line arguments, the first one being the program name
    fn try_parse_from<I>(iter: I) -> Result<Self, String>
    where
        I: IntoIterator<Item = OsString>,
    {
        let mut options = ExecOptions::default();
        let mut arg_iter = iter.into_iter().skip(1);

        while let Some(arg) = arg_iter.next() {
            let Some(text) = arg.to_str() else {
                options.command.push(arg);
                options.command.extend(arg_iter);
                break;
            };

            match text {
                "--" => {
                    options.command.extend(arg_iter);
                    break;
                }
                flags if flags.starts_with('-') && flags.len() > 1 => {
                    // split combined shorthand options
                    for (n, char) in flags[1..].char_indices() {
                        if Self::TAKES_ARGUMENT_SHORT.contains(&char) {
                            let rest = &flags[(n + 2)..];
                            let value = if !rest.is_empty() {
                                OsString::from(rest)
                            } else if let Some(next) = arg_iter.next() {
                                next
                            } else {
                                Err(format!("'-{char}' expects an argument"))?
                            };
                            options.apply_argument(char, value)?;
                            break;
                        }
                        options.apply_flag(char)?;
                    }
                }
                _command => {
                    options.command.push(arg);
                    options.command.extend(arg_iter);
                    break;
                }
            }
        }

        if options.command.is_empty() {
            Err("no command given")?;
        }

        Ok(options)
    }

    fn apply_flag(&mut self, flag: char) -> Result<(), String> {
        match flag {
            'P' => self.use_pty = true,
            'b' => self.background = true,
            'i' => self.intercept = true,
            'I' => self.log_subcmds = true,
            'N' => self.noexec = true,
            other => Err(format!("invalid option '-{other}'"))?,
        }

        Ok(())
    }

    fn apply_argument(&mut self, option: char, value: OsString) -> Result<(), String> {
        match option {
            'T' => {
                let secs = value
                    .to_str()
                    .and_then(|secs| secs.parse::<u64>().ok())
                    .ok_or_else(|| format!("invalid timeout '{}'", value.to_string_lossy()))?;
                self.timeout = Some(Duration::from_secs(secs));
            }
            'D' => self.directory = Some(PathBuf::from(value)),
            other => Err(format!("invalid option '-{other}'"))?,
        }

        Ok(())
    }

    fn into_details(self, command: PathBuf) -> CommandDetails {
        let mut details = CommandDetails::new(command)
            .args(self.command.into_iter().skip(1))
            .env(std::env::vars_os().map(|(key, value)| {
                let mut entry = key;
                entry.push("=");
                entry.push(value);
                entry
            }))
            .flags(ExecFlags {
                use_pty: self.use_pty,
                background: self.background,
                intercept: self.intercept,
                log_subcmds: self.log_subcmds,
                noexec: self.noexec,
                ..Default::default()
            });

        if let Some(timeout) = self.timeout {
            details = details.timeout(timeout);
        }

        if let Some(directory) = self.directory {
            details = details.cwd(directory);
        }

        details
    }
}

/// Accept whatever the command tries to execute, as it is.
struct AllowAll;

impl PolicyPlugin for AllowAll {
    fn check_policy(&mut self, argv: &[OsString], envp: &[OsString]) -> PolicyDecision {
        let Some(command) = argv.first().and_then(|arg0| resolve_command(Path::new(arg0))) else {
            return PolicyDecision::Reject("command not found".into());
        };

        PolicyDecision::Accept {
            command,
            run_argv: argv.to_vec(),
            run_envp: envp.to_vec(),
        }
    }
}

fn is_executable(path: &Path) -> bool {
    path.metadata()
        .is_ok_and(|meta| meta.is_file() && meta.permissions().mode() & 0o111 != 0)
}

/// Look up `command` in `PATH` unless it already names a location.
fn resolve_command(command: &Path) -> Option<PathBuf> {
    if command.as_os_str().as_bytes().contains(&b'/') {
        return Some(command.to_owned());
    }

    let path = std::env::var_os("PATH")?;
    std::env::split_paths(&path)
        .map(|dir| dir.join(command))
        .find(|candidate| is_executable(candidate))
}

fn exit_code(status: CommandStatus) -> i32 {
    match status.exit_reason() {
        Some(ExitReason::Code(code)) => code,
        Some(ExitReason::Signal(signal)) => 128 + signal,
        None => 1,
    }
}

fn sudo_exec_process() -> Result<i32, Error> {
    let options = ExecOptions::try_parse_from(std::env::args_os())
        .map_err(|e| Error::Options(format!("{e}\n{USAGE_MSG}")))?;

    let arg0 = PathBuf::from(&options.command[0]);
    let command = resolve_command(&arg0).ok_or(Error::InvalidCommand(arg0))?;
    let details = options.into_details(command);

    let mut plugins = Plugins::new([Plugin::Policy(Box::new(AllowAll))])?;

    Ok(exit_code(run_command(&details, &mut plugins)?))
}

fn main() {
    SudoLogger::new("sudo-exec: ").into_global_logger();

    match sudo_exec_process() {
        Ok(code) => std::process::exit(code),
        Err(error) => {
            error.report();
            std::process::exit(1);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{ffi::OsString, path::PathBuf, time::Duration};

    use pretty_assertions::assert_eq;

    use super::ExecOptions;

    fn parse(args: &[&str]) -> Result<ExecOptions, String> {
        ExecOptions::try_parse_from(
            std::iter::once("sudo-exec")
                .chain(args.iter().copied())
                .map(OsString::from),
        )
    }

    fn command(args: &[&str]) -> Vec<OsString> {
        args.iter().map(OsString::from).collect()
    }

    #[test]
    fn combined_flags_and_arguments() {
        let options = parse(&["-PbT", "5", "-D/tmp", "--", "ls", "-l"]).unwrap();

        assert_eq!(
            options,
            ExecOptions {
                use_pty: true,
                background: true,
                timeout: Some(Duration::from_secs(5)),
                directory: Some(PathBuf::from("/tmp")),
                command: command(&["ls", "-l"]),
                ..Default::default()
            }
        );
    }

    #[test]
    fn command_starts_at_first_operand() {
        let options = parse(&["-iIN", "sh", "-c", "true"]).unwrap();

        assert!(options.intercept && options.log_subcmds && options.noexec);
        assert_eq!(options.command, command(&["sh", "-c", "true"]));
    }

    #[test]
    fn rejects_bad_input() {
        assert_eq!(parse(&["-x", "ls"]).unwrap_err(), "invalid option '-x'");
        assert_eq!(parse(&["-T"]).unwrap_err(), "'-T' expects an argument");
        assert_eq!(parse(&["-T", "soon", "ls"]).unwrap_err(), "invalid timeout 'soon'");
        assert_eq!(parse(&["-P", "--"]).unwrap_err(), "no command given");
    }

    #[test]
    fn commands_are_found_in_path() {
        let sh = super::resolve_command("sh".as_ref()).unwrap();
        assert!(sh.is_absolute());
        assert_eq!(
            super::resolve_command("./local".as_ref()),
            Some(PathBuf::from("./local"))
        );
    }
}
