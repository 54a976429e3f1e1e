// Language registry
// Static table: filenames, toolchain commands and container images per language.

use codeverse_common::types::Language;
use std::path::Path;
use tokio::process::Command;

/// A program plus its arguments, relative to the scratch directory
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: &'static str,
    pub args: &'static [&'static str],
}

impl CommandSpec {
    /// Build a command that runs inside `workdir`.
    /// A `./` program is resolved against `workdir` so it never depends on
    /// how the platform treats relative paths combined with `current_dir`.
    pub fn command(&self, workdir: &Path) -> Command {
        let mut cmd = match self.program.strip_prefix("./") {
            Some(local) => Command::new(workdir.join(local)),
            None => Command::new(self.program),
        };
        cmd.args(self.args).current_dir(workdir);
        cmd
    }

    /// Shell form, used inside container pipelines
    pub fn shell(&self) -> String {
        std::iter::once(self.program)
            .chain(self.args.iter().copied())
            .collect::<Vec<_>>()
            .join(" ")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LanguageSpec {
    pub language: Language,
    pub source_filename: &'static str,
    pub file_extension: &'static str,
    pub compile: Option<CommandSpec>,
    pub run: CommandSpec,
    /// File the compile phase leaves behind
    pub artifact: Option<&'static str>,
    pub container_image: &'static str,
}

const PYTHON: LanguageSpec = LanguageSpec {
    language: Language::Python,
    source_filename: "main.py",
    file_extension: "py",
    compile: None,
    run: CommandSpec { program: "python3", args: &["-u", "main.py"] },
    artifact: None,
    container_image: "python:3.9-alpine",
};

const JAVA: LanguageSpec = LanguageSpec {
    language: Language::Java,
    source_filename: "Main.java",
    file_extension: "java",
    compile: Some(CommandSpec { program: "javac", args: &["Main.java"] }),
    run: CommandSpec { program: "java", args: &["-cp", ".", "Main"] },
    artifact: Some("Main.class"),
    container_image: "openjdk:11-jdk-slim",
};

const C: LanguageSpec = LanguageSpec {
    language: Language::C,
    source_filename: "main.c",
    file_extension: "c",
    compile: Some(CommandSpec { program: "gcc", args: &["main.c", "-o", "main"] }),
    run: CommandSpec { program: "./main", args: &[] },
    artifact: Some("main"),
    container_image: "gcc:latest",
};

const CPP: LanguageSpec = LanguageSpec {
    language: Language::Cpp,
    source_filename: "main.cpp",
    file_extension: "cpp",
    compile: Some(CommandSpec { program: "g++", args: &["main.cpp", "-o", "main"] }),
    run: CommandSpec { program: "./main", args: &[] },
    artifact: Some("main"),
    container_image: "gcc:latest",
};

const JAVASCRIPT: LanguageSpec = LanguageSpec {
    language: Language::Javascript,
    source_filename: "script.js",
    file_extension: "js",
    compile: None,
    run: CommandSpec { program: "node", args: &["script.js"] },
    artifact: None,
    container_image: "node:16-alpine",
};

/// Registry entry for a known language
pub fn spec(language: Language) -> &'static LanguageSpec {
    match language {
        Language::Python => &PYTHON,
        Language::Java => &JAVA,
        Language::C => &C,
        Language::Cpp => &CPP,
        Language::Javascript => &JAVASCRIPT,
    }
}

/// Resolve a language identifier. Unknown identifiers resolve to python.
pub fn resolve(language: &str) -> &'static LanguageSpec {
    spec(Language::resolve(language))
}

/// Every registered language, in a stable order
pub fn all() -> impl Iterator<Item = &'static LanguageSpec> {
    Language::ALL.iter().map(|language| spec(*language))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_known_languages() {
        assert_eq!(resolve("java").source_filename, "Main.java");
        assert_eq!(resolve("c").compile.map(|c| c.program), Some("gcc"));
        assert_eq!(resolve("cpp").compile.map(|c| c.program), Some("g++"));
        assert_eq!(resolve("javascript").run.program, "node");
        assert_eq!(resolve("python").container_image, "python:3.9-alpine");
    }

    #[test]
    fn test_unknown_language_falls_back_to_python() {
        let entry = resolve("brainfuck");
        assert_eq!(entry.language, Language::Python);
        assert_eq!(entry.source_filename, "main.py");
    }

    #[test]
    fn test_compile_phase_matches_language() {
        for entry in all() {
            assert_eq!(entry.compile.is_some(), entry.language.is_compiled(), "{}", entry.language);
            assert_eq!(entry.artifact.is_some(), entry.language.is_compiled(), "{}", entry.language);
            assert!(entry.source_filename.ends_with(entry.file_extension));
        }
        assert_eq!(all().count(), 5);
    }

    #[test]
    fn test_shell_form() {
        assert_eq!(spec(Language::Java).run.shell(), "java -cp . Main");
        assert_eq!(spec(Language::C).run.shell(), "./main");
    }

    #[test]
    fn test_local_program_resolved_against_workdir() {
        let cmd = spec(Language::C).run.command(Path::new("/tmp/scratch-x"));
        assert_eq!(cmd.as_std().get_program(), "/tmp/scratch-x/main");
        assert_eq!(cmd.as_std().get_current_dir(), Some(Path::new("/tmp/scratch-x")));
    }
}
