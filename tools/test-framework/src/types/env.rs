/*!
   Types for exporting the topology of a test run as environment
   variables.
*/

use core::convert::AsRef;
use itertools::Itertools;
use std::collections::BTreeMap;
use std::fs::write;
use std::path::Path;

use crate::error::Error;

/**
    Implemented by values that describe part of a running topology.

    The framework exports them as `.env` files, which users can
    `source` in a terminal to reach the containers of a suspended test.
*/
pub trait ExportEnv {
    fn export_env(&self, writer: &mut impl EnvWriter);
}

pub trait EnvWriter {
    /**
       Write an environment variable with the given key and value.

       Overlapping keys are overridden with the new value.
    */
    fn write_env(&mut self, key: &str, value: &str);
}

/**
   Create an [`EnvWriter`] that adds a prefix to the keys of the exported envs.
*/
pub fn prefix_writer<'a, Writer: EnvWriter>(
    prefix: &str,
    writer: &'a mut Writer,
) -> impl EnvWriter + 'a {
    PrefixEnvWriter {
        prefix: env_key(prefix),
        writer,
    }
}

pub struct PrefixEnvWriter<'a, Writer> {
    prefix: String,
    writer: &'a mut Writer,
}

impl EnvWriter for BTreeMap<String, String> {
    fn write_env(&mut self, key: &str, value: &str) {
        self.insert(key.to_string(), value.to_string());
    }
}

impl<'a, Writer: EnvWriter> EnvWriter for PrefixEnvWriter<'a, Writer> {
    fn write_env(&mut self, key: &str, value: &str) {
        self.writer
            .write_env(&format!("{}_{}", self.prefix, key), value);
    }
}

/// Uppercase a name and replace everything but letters and digits with `_`.
pub fn env_key(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_uppercase()
            } else {
                '_'
            }
        })
        .collect()
}

/**
   Format the variables exported by `exporter` as `KEY=VALUE` lines.
*/
pub fn format_env(exporter: &impl ExportEnv) -> String {
    let mut envs = BTreeMap::new();
    exporter.export_env(&mut envs);

    envs.iter()
        .map(|(key, value)| format!("{key}={value}"))
        .join("\n")
}

/**
   Save the variables exported by `exporter` as a `.env` file.
*/
pub fn write_env(path: impl AsRef<Path>, exporter: &impl ExportEnv) -> Result<(), Error> {
    write(path, format_env(exporter))?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Node;

    impl ExportEnv for Node {
        fn export_env(&self, writer: &mut impl EnvWriter) {
            writer.write_env("RPC", "http://val-0:26657");
        }
    }

    #[test]
    fn prefixes_keys() {
        let mut envs = BTreeMap::new();
        Node.export_env(&mut prefix_writer("gaia-1", &mut envs));

        assert_eq!(format_env(&Node), "RPC=http://val-0:26657");
        assert_eq!(
            envs.get("GAIA_1_RPC").map(String::as_str),
            Some("http://val-0:26657")
        );
    }
}
