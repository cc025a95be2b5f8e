use clap::{ArgAction, Parser, Subcommand};
use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::config::{Backend, ConfigError, Settings};
use crate::descriptor::VersionDescriptor;
use crate::error::OrchestratorError;
use crate::resources::ResourceBuilder;

#[derive(Parser, Debug)]
#[command(name = "verso")]
#[command(about = "Orchestrate the lifecycle of versioned data pipelines on Kubernetes")]
#[command(version)]
pub struct Cli {
    /// Enable verbose logging output (-v, -vv, -vvv)
    #[arg(short, long, action = ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Path to the settings file (default: ~/.verso/config.yaml)
    #[arg(long, global = true, env = "VERSO_CONFIG")]
    pub config: Option<String>,

    /// Path to a .env file loaded before anything else
    #[arg(long, value_name = "FILE", global = true)]
    pub env_file: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the RPC server
    Serve(ServeArgs),

    /// Print the cluster objects of a version descriptor without applying them
    Render(RenderArgs),

    /// Print the effective settings
    Config,
}

/// Arguments for the serve command
#[derive(Parser, Debug, Default)]
pub struct ServeArgs {
    /// Cluster backend
    #[arg(long, value_enum, env = "VERSO_BACKEND")]
    pub backend: Option<Backend>,

    /// Default namespace for requests that omit one
    #[arg(short, long, env = "VERSO_NAMESPACE")]
    pub namespace: Option<String>,

    /// Bind address for the server
    #[arg(long, env = "VERSO_BIND_ADDR")]
    pub bind_addr: Option<String>,

    /// Port to listen on
    #[arg(short, long, env = "VERSO_PORT")]
    pub port: Option<u16>,
}

impl ServeArgs {
    /// Layer command-line overrides on top of file settings
    pub fn apply(&self, settings: &mut Settings) {
        if let Some(backend) = self.backend {
            settings.cluster.backend = backend;
        }
        if let Some(ref namespace) = self.namespace {
            settings.cluster.namespace = namespace.clone();
        }
        if let Some(ref bind_addr) = self.bind_addr {
            settings.server.bind_addr = bind_addr.clone();
        }
        if let Some(port) = self.port {
            settings.server.port = port;
        }
    }
}

/// Arguments for the render command
#[derive(Parser, Debug)]
pub struct RenderArgs {
    /// Version descriptor (JSON or YAML)
    pub descriptor: PathBuf,
}

#[derive(Error, Debug)]
pub enum CliError {
    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Orchestrator(#[from] OrchestratorError),
}

// ============================================================================
// SBIO: Pure rendering (no I/O)
// ============================================================================

/// Parse a descriptor, choosing the format from the file extension
pub fn parse_descriptor(path: &Path, content: &str) -> Result<VersionDescriptor, CliError> {
    let descriptor = match path.extension().and_then(|e| e.to_str()) {
        Some("yaml") | Some("yml") => VersionDescriptor::from_yaml(content)?,
        _ => VersionDescriptor::from_json(content)?,
    };
    Ok(descriptor)
}

/// Render every object of a version as a multi-document YAML stream
pub fn render(descriptor: &VersionDescriptor, settings: &Settings) -> Result<String, CliError> {
    let builder = ResourceBuilder::new(settings.workloads.clone(), settings.ingress.clone());
    let set = builder.build(descriptor)?;
    Ok(set.to_yaml()?)
}

// ============================================================================
// I/O boundary
// ============================================================================

/// Read and render a descriptor file
pub fn render_file(path: &Path, settings: &Settings) -> Result<String, CliError> {
    let content = std::fs::read_to_string(path)?;
    let descriptor = parse_descriptor(path, &content)?;
    render(&descriptor, settings)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const DESCRIPTOR_YAML: &str = r#"
productId: p1
versionName: v1
config:
  - key: K
    value: "1"
entrypoint:
  image: entrypoint:1
  protoFile: public_input.proto
workflows:
  - name: w1
    nodes:
      - name: n1
        image: node:1
    edges: []
"#;

    #[test]
    fn test_parse_serve_overrides() {
        let cli = Cli::parse_from([
            "verso", "serve", "--backend", "memory", "--namespace", "kre", "--port", "9999",
        ]);
        match cli.command {
            Commands::Serve(args) => {
                let mut settings = Settings::default();
                args.apply(&mut settings);
                assert_eq!(settings.cluster.backend, Backend::Memory);
                assert_eq!(settings.cluster.namespace, "kre");
                assert_eq!(settings.server.port, 9999);
                assert_eq!(settings.server.bind_addr, "0.0.0.0");
            }
            _ => panic!("Expected Serve command"),
        }
    }

    #[test]
    fn test_parse_render() {
        let cli = Cli::parse_from(["verso", "-vv", "render", "version.yaml"]);
        assert_eq!(cli.verbose, 2);
        match cli.command {
            Commands::Render(args) => {
                assert_eq!(args.descriptor, PathBuf::from("version.yaml"));
            }
            _ => panic!("Expected Render command"),
        }
    }

    #[test]
    fn test_parse_config() {
        let cli = Cli::parse_from(["verso", "config", "--config", "/tmp/verso.yaml"]);
        assert!(matches!(cli.command, Commands::Config));
        assert_eq!(cli.config.as_deref(), Some("/tmp/verso.yaml"));
    }

    #[test]
    fn test_render_yaml_descriptor() {
        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        file.write_all(DESCRIPTOR_YAML.as_bytes()).unwrap();

        let output = render_file(file.path(), &Settings::default()).unwrap();
        assert!(output.contains("name: p1-v1-config"));
        assert!(output.contains("name: p1-v1-conf-files"));
        assert!(output.contains("name: p1-v1-w1-n1"));
        assert!(output.contains("name: p1-v1-entrypoint"));
        assert_eq!(output.matches("kind: Deployment").count(), 2);
    }

    #[test]
    fn test_render_rejects_invalid_descriptor() {
        let content = DESCRIPTOR_YAML.replace("image: node:1", "image: \"\"");
        let descriptor = parse_descriptor(Path::new("v.yaml"), &content).unwrap();

        let err = render(&descriptor, &Settings::default()).unwrap_err();
        assert!(matches!(
            err,
            CliError::Orchestrator(OrchestratorError::InvalidDescriptor(_))
        ));
    }
}
