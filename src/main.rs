#![recursion_limit = "1024"]
use std::io;
use std::sync::Arc;

#[cfg(unix)]
use std::fs;

use clap::Parser;
use lsp_server::Connection;
use tokio::net::{TcpListener, UnixListener};
use tracing::{error, info, warn};

#[cfg(windows)]
use tokio::net::windows::named_pipe::NamedPipeServer;

use tokio_tungstenite::accept_async;

use lsphost::build::ManifestFileDetector;
use lsphost::content::{DocumentContentStore, NullDocumentContentStore};
use lsphost::host::LspHost;
use lsphost::ids::DocumentUri;
use lsphost::lifecycle::{LifecycleOrchestrator, StdProcessExitHook};
use lsphost::logging::init_logger;
use lsphost::semantic_index::FixedLanguageDetector;
use lsphost::services::directory::{LanguageServiceDirectory, NullCapabilityRegistrar, NullServiceFactory};
use lsphost::services::ServiceKindRegistry;
use lsphost::settings::{ServerSettings, SharedSettings};
use lsphost::transport::{self, ConnectionManager};
use lsphost::workspace::router::WorkspaceRouter;
use lsphost::workspace::DefaultWorkspaceFactory;

#[derive(Debug, Clone, PartialEq)]
enum CommMode {
    Stdio,
    Socket(u16),
    Pipe(String),
    WebSocket(u16),
}

#[derive(Debug)]
struct ServerConfig {
    log_level: String,
    no_color: bool,
    comm_mode: CommMode,
    client_process_id: Option<u32>,
    max_concurrent_index_tasks: Option<usize>,
}

impl ServerConfig {
    fn from_args() -> io::Result<Self> {
        #[derive(Parser, Debug)]
        #[command(
            version,
            about = "LSP message-dispatch and workspace-routing host",
            long_about = "Fronts one or more toolchain-specific backend language services behind a single LSP connection, scheduling and routing every request and notification."
        )]
        struct Args {
            #[arg(
                long,
                default_value = "info",
                help = "Set the logging level for the server",
                value_parser = ["error", "warn", "info", "debug", "trace"]
            )]
            log_level: String,
            #[arg(long, help = "Disable ANSI color output")]
            no_color: bool,
            #[arg(
                long,
                help = "Use stdin/stdout for communication (mutually exclusive with --socket, --pipe, --websocket)",
                conflicts_with_all = ["socket", "websocket", "pipe"]
            )]
            stdio: bool,
            #[arg(
                long,
                requires = "port",
                help = "Use TCP socket for communication (requires --port; mutually exclusive with --stdio, --pipe, --websocket)",
                conflicts_with_all = ["stdio", "pipe", "websocket"]
            )]
            socket: bool,
            #[arg(
                long,
                requires = "port",
                help = "Use WebSocket for communication (requires --port; mutually exclusive with --stdio, --socket, --pipe)",
                conflicts_with_all = ["stdio", "socket", "pipe"]
            )]
            websocket: bool,
            #[arg(long, help = "Port number for socket or WebSocket communication")]
            port: Option<u16>,
            #[arg(
                long,
                alias = "clientProcessId",
                help = "Process ID of the client for liveness monitoring (optional)"
            )]
            client_process_id: Option<u32>,
            #[arg(
                long,
                help = "Path to named pipe or Unix socket (e.g., '\\\\.\\pipe\\lsphost' on Windows or '/tmp/lsphost.socket' on Unix; mutually exclusive with --stdio, --socket, --websocket)",
                conflicts_with_all = ["stdio", "socket", "websocket"]
            )]
            pipe: Option<String>,
            #[arg(
                long,
                help = "Upper bound on concurrently running background index tasks (defaults to a fraction of available CPUs; see workspace/didChangeConfiguration's indexTaskConcurrencyFraction for the runtime-adjustable knob)"
            )]
            max_concurrent_index_tasks: Option<usize>,
        }

        let args = Args::parse();

        let comm_mode = match (args.stdio, args.socket, args.websocket, args.pipe) {
            (true, false, false, None) => CommMode::Stdio,
            (false, true, false, None) => {
                let port = args.port.ok_or_else(|| {
                    error!("The --port option is required when --socket is used.");
                    io::Error::new(io::ErrorKind::InvalidInput, "Port required for socket mode")
                })?;
                CommMode::Socket(port)
            }
            (false, false, true, None) => {
                let port = args.port.ok_or_else(|| {
                    error!("The --port option is required when --websocket is used.");
                    io::Error::new(io::ErrorKind::InvalidInput, "Port required for websocket mode")
                })?;
                CommMode::WebSocket(port)
            }
            (false, false, false, Some(pipe)) => {
                #[cfg(windows)]
                if !pipe.starts_with(r"\\.\pipe\") {
                    error!("Invalid named pipe path: {}. Must start with '\\\\.\\pipe\\'.", pipe);
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidInput,
                        format!("Invalid named pipe path: {}", pipe),
                    ));
                }
                CommMode::Pipe(pipe)
            }
            _ => {
                error!("Exactly one of --stdio, --socket, --websocket, --pipe must be specified.");
                return Err(io::Error::new(io::ErrorKind::InvalidInput, "Invalid communication mode"));
            }
        };

        Ok(ServerConfig {
            log_level: args.log_level,
            no_color: args.no_color,
            comm_mode,
            client_process_id: args.client_process_id,
            max_concurrent_index_tasks: args.max_concurrent_index_tasks,
        })
    }
}

/// Everything a freshly accepted connection needs to build its own
/// `LspHost`. Cheap to clone: every field is itself a handle (`Arc`,
/// `mpsc::Sender`, or a `Clone` wrapper around one).
#[derive(Clone)]
struct HostBuilder {
    router: WorkspaceRouter,
    dispatcher: Arc<lsphost::dispatch::RequestDispatcher>,
    lifecycle: Arc<LifecycleOrchestrator>,
    settings: Arc<SharedSettings>,
    content_store: Arc<dyn DocumentContentStore>,
}

impl HostBuilder {
    fn build(&self, out: crossbeam_channel::Sender<lsp_server::Message>) -> Arc<LspHost> {
        LspHost::new(
            self.router.clone(),
            self.dispatcher.clone(),
            self.lifecycle.clone(),
            self.settings.clone(),
            self.content_store.clone(),
            out,
        )
    }
}

#[cfg(unix)]
async fn monitor_client_process(client_pid: u32, conn_manager: ConnectionManager) {
    use nix::unistd::Pid;
    use tokio::time::{sleep, Duration};

    let pid = Pid::from_raw(client_pid as i32);
    loop {
        match nix::sys::signal::kill(pid, None) {
            Ok(()) => sleep(Duration::from_secs(1)).await,
            Err(nix::Error::ESRCH) => {
                info!("client process (PID: {}) no longer exists, shutting down server", client_pid);
                conn_manager.shutdown_notify().notify_waiters();
                break;
            }
            Err(e) => {
                error!("error checking client process (PID: {}): {}", client_pid, e);
                sleep(Duration::from_secs(1)).await;
            }
        }
    }
}

#[cfg(windows)]
async fn monitor_client_process(client_pid: u32, conn_manager: ConnectionManager) {
    use std::ptr;
    use windows::Win32::Foundation::{HANDLE, WAIT_OBJECT_0};
    use windows::Win32::System::Threading::{OpenProcess, WaitForSingleObject, PROCESS_QUERY_INFORMATION};

    unsafe {
        let handle = OpenProcess(PROCESS_QUERY_INFORMATION, false, client_pid);
        if handle == HANDLE(ptr::null_mut()) {
            error!("failed to open client process (PID: {})", client_pid);
            return;
        }
        let result = WaitForSingleObject(handle, 0xFFFFFFFF);
        if result == WAIT_OBJECT_0 {
            info!("client process (PID: {}) terminated, shutting down server", client_pid);
            conn_manager.shutdown_notify().notify_waiters();
        } else {
            error!("error waiting for client process (PID: {}): {:?}", client_pid, result);
        }
    }
}

async fn run_stdio_server(builder: HostBuilder, conn_manager: ConnectionManager) -> io::Result<()> {
    info!("starting server with stdin/stdout communication");
    let (connection, io_threads) = transport::stdio_connection();
    let host = builder.build(connection.sender.clone());
    conn_manager.serve(host, connection, io_threads, "stdio".to_string());

    conn_manager.shutdown_notify().notified().await;
    conn_manager.shutdown_all().await;
    conn_manager.wait_for_tasks().await;
    Ok(())
}

async fn run_socket_server(builder: HostBuilder, conn_manager: ConnectionManager, port: u16) -> io::Result<()> {
    info!("starting server with TCP socket communication on port {}", port);
    let listener = TcpListener::bind(format!("127.0.0.1:{}", port)).await?;
    info!("TCP server listening on 127.0.0.1:{}", port);

    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, addr)) => {
                        let (connection, io_threads) = transport::async_stream_connection(stream);
                        let host = builder.build(connection.sender.clone());
                        conn_manager.serve(host, connection, io_threads, addr.to_string());
                        conn_manager.remove_closed_connections();
                    }
                    Err(e) => error!("failed to accept TCP connection: {}", e),
                }
            }
            _ = conn_manager.shutdown_notify().notified() => {
                info!("main shutdown signal received, closing TCP server");
                break;
            }
        }
    }
    conn_manager.shutdown_all().await;
    conn_manager.wait_for_tasks().await;
    Ok(())
}

async fn run_websocket_server(builder: HostBuilder, conn_manager: ConnectionManager, port: u16) -> io::Result<()> {
    info!("starting server with WebSocket communication on port {}", port);
    let listener = TcpListener::bind(format!("127.0.0.1:{}", port)).await?;
    info!("WebSocket server listening on 127.0.0.1:{}", port);

    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, addr)) => match accept_async(stream).await {
                        Ok(ws_stream) => {
                            let adapter = transport::WebSocketStreamAdapter::new(ws_stream);
                            let (connection, io_threads) = transport::async_stream_connection(adapter);
                            let host = builder.build(connection.sender.clone());
                            conn_manager.serve(host, connection, io_threads, addr.to_string());
                            conn_manager.remove_closed_connections();
                        }
                        Err(e) => error!("failed to accept WebSocket connection from {}: {}", addr, e),
                    },
                    Err(e) => error!("failed to accept TCP connection: {}", e),
                }
            }
            _ = conn_manager.shutdown_notify().notified() => {
                info!("main shutdown signal received, closing WebSocket server");
                break;
            }
        }
    }
    conn_manager.shutdown_all().await;
    conn_manager.wait_for_tasks().await;
    Ok(())
}

async fn run_named_pipe_server(builder: HostBuilder, conn_manager: ConnectionManager, pipe_path: &str) -> io::Result<()> {
    #[cfg(windows)]
    {
        info!("starting server with named pipe communication at {}", pipe_path);
        loop {
            let server = NamedPipeServer::new(pipe_path)?;
            tokio::select! {
                result = server.connect() => {
                    if let Err(e) = result {
                        error!("failed to accept named pipe connection: {}", e);
                    } else {
                        let addr = format!("named_pipe:{}", pipe_path);
                        let (connection, io_threads) = transport::async_stream_connection(server);
                        let host = builder.build(connection.sender.clone());
                        conn_manager.serve(host, connection, io_threads, addr);
                        conn_manager.remove_closed_connections();
                    }
                }
                _ = conn_manager.shutdown_notify().notified() => {
                    info!("main shutdown signal received, closing named pipe server");
                    break;
                }
            }
        }
        conn_manager.shutdown_all().await;
        conn_manager.wait_for_tasks().await;
    }
    #[cfg(unix)]
    {
        info!("starting server with Unix domain socket communication at {}", pipe_path);
        if std::path::Path::new(pipe_path).exists() {
            fs::remove_file(pipe_path)?;
        }
        let listener = UnixListener::bind(pipe_path)?;
        let cleanup = scopeguard::guard(pipe_path.to_string(), |path| {
            if let Err(e) = fs::remove_file(&path) {
                error!("failed to clean up Unix socket file {}: {}", path, e);
            } else {
                info!("cleaned up Unix socket file {}", path);
            }
        });
        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let addr = format!("unix_socket:{:?}", addr);
                            let (connection, io_threads) = transport::async_stream_connection(stream);
                            let host = builder.build(connection.sender.clone());
                            conn_manager.serve(host, connection, io_threads, addr);
                            conn_manager.remove_closed_connections();
                        }
                        Err(e) => error!("failed to accept Unix socket connection: {}", e),
                    }
                }
                _ = conn_manager.shutdown_notify().notified() => {
                    info!("main shutdown signal received, closing Unix socket server");
                    break;
                }
            }
        }
        drop(cleanup);
        conn_manager.shutdown_all().await;
        conn_manager.wait_for_tasks().await;
    }
    #[cfg(not(any(windows, unix)))]
    {
        error!("named pipe/Unix domain socket communication is not supported on this platform");
        return Err(io::Error::new(
            io::ErrorKind::Other,
            "Named pipe/Unix domain socket communication is not supported on this platform.",
        ));
    }
    Ok(())
}

fn build_host_builder(config: &ServerConfig) -> HostBuilder {
    let router = WorkspaceRouter::new(Vec::new(), Arc::new(DefaultWorkspaceFactory), Arc::new(ManifestFileDetector::default()));

    let (directory, mut crash_rx) = LanguageServiceDirectory::new(
        ServiceKindRegistry::default(),
        Arc::new(NullServiceFactory),
        Arc::new(NullCapabilityRegistrar),
    );
    let directory = Arc::new(directory);

    let language_detector = Arc::new(FixedLanguageDetector("primary".to_string()));
    let dispatcher = Arc::new(lsphost::dispatch::RequestDispatcher::new(
        router.clone(),
        directory.clone(),
        language_detector,
        Arc::new(SharedSettings::default()),
        lsp_types::ClientCapabilities::default(),
    ));
    let lifecycle = Arc::new(LifecycleOrchestrator::new(router.clone(), directory.clone(), Arc::new(StdProcessExitHook)));

    let content_store: Arc<dyn DocumentContentStore> = Arc::new(NullDocumentContentStore);

    // Restores service state after a backend crash (§4.5 "Crash handling"):
    // evict the dead instance so the next request restarts it, then
    // resynthesize close+open for every document that was bound to it so the
    // fresh instance sees them again.
    {
        let directory = directory.clone();
        let dispatcher = dispatcher.clone();
        let content_store = content_store.clone();
        tokio::spawn(async move {
            while let Some(event) = crash_rx.recv().await {
                warn!(kind = ?event.kind, toolchain = ?event.toolchain, root = ?event.workspace_root, documents = event.documents.len(), "backend language service crashed");
                directory.evict(event.kind, &event.toolchain, event.workspace_root.as_deref());
                for doc in &event.documents {
                    let uri = DocumentUri::new(doc.as_url().clone());
                    dispatcher.document_closed(&uri).await;
                    match content_store.current(&uri).await {
                        Some((text, version)) => dispatcher.document_opened(&uri, &text, version).await,
                        None => warn!(doc = %uri, "no content available to reopen after crash"),
                    }
                }
            }
        });
    }

    let mut initial = ServerSettings::default();
    if let Some(max_tasks) = config.max_concurrent_index_tasks {
        let available = std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1);
        initial.index_task_concurrency_fraction = (max_tasks as f32 / available as f32).min(1.0);
    }
    let settings = Arc::new(SharedSettings::new(initial));

    HostBuilder { router, dispatcher, lifecycle, settings, content_store }
}

async fn run_server(config: ServerConfig, conn_manager: ConnectionManager) -> io::Result<()> {
    init_logger(config.no_color, Some(&config.log_level))?;
    info!("initializing lsphost with log level {}", config.log_level);

    let builder = build_host_builder(&config);

    if let Some(client_pid) = config.client_process_id {
        let conn_manager_clone = conn_manager.clone();
        let monitor_task = tokio::spawn(async move {
            monitor_client_process(client_pid, conn_manager_clone).await;
        });
        conn_manager.add_task(monitor_task);
    }

    match config.comm_mode.clone() {
        CommMode::Stdio => run_stdio_server(builder, conn_manager).await?,
        CommMode::Socket(port) => run_socket_server(builder, conn_manager, port).await?,
        CommMode::WebSocket(port) => run_websocket_server(builder, conn_manager, port).await?,
        CommMode::Pipe(ref pipe_path) => run_named_pipe_server(builder, conn_manager, pipe_path).await?,
    }

    info!("server terminated");
    Ok(())
}

#[tokio::main]
async fn main() -> io::Result<()> {
    let config = ServerConfig::from_args()?;
    let conn_manager = ConnectionManager::new();

    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigint = signal(SignalKind::interrupt())?;
        let mut sigterm = signal(SignalKind::terminate())?;

        tokio::select! {
            result = run_server(config, conn_manager.clone()) => {
                conn_manager.shutdown_all().await;
                conn_manager.wait_for_tasks().await;
                result
            }
            _ = sigint.recv() => {
                info!("received SIGINT, initiating shutdown");
                conn_manager.shutdown_all().await;
                conn_manager.wait_for_tasks().await;
                Ok(())
            }
            _ = sigterm.recv() => {
                info!("received SIGTERM, initiating shutdown");
                conn_manager.shutdown_all().await;
                conn_manager.wait_for_tasks().await;
                Ok(())
            }
        }
    }

    #[cfg(windows)]
    {
        use tokio::signal::ctrl_c;
        tokio::select! {
            result = run_server(config, conn_manager.clone()) => {
                conn_manager.shutdown_all().await;
                conn_manager.wait_for_tasks().await;
                result
            }
            _ = ctrl_c() => {
                info!("received Ctrl+C, initiating shutdown");
                conn_manager.shutdown_all().await;
                conn_manager.wait_for_tasks().await;
                Ok(())
            }
        }
    }

    #[cfg(not(any(unix, windows)))]
    {
        run_server(config, conn_manager.clone()).await?;
        conn_manager.shutdown_all().await;
        conn_manager.wait_for_tasks().await;
        Ok(())
    }
}
