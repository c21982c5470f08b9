use embedded_influx_core::ProcessManagerFactory;

/// Platform-independent factory that selects the appropriate implementation at compile time
pub struct PlatformProcessManagerFactory;

impl ProcessManagerFactory for PlatformProcessManagerFactory {
    #[cfg(unix)]
    type Manager = embedded_influx_unix::UnixProcessManager;

    #[cfg(windows)]
    type Manager = embedded_influx_windows::WindowsProcessManager;

    fn create_process_manager() -> Self::Manager {
        #[cfg(unix)]
        return embedded_influx_unix::UnixProcessManagerFactory::create_process_manager();

        #[cfg(windows)]
        return embedded_influx_windows::WindowsProcessManagerFactory::create_process_manager();
    }

    fn platform_name() -> &'static str {
        #[cfg(unix)]
        return embedded_influx_unix::UnixProcessManagerFactory::platform_name();

        #[cfg(windows)]
        return embedded_influx_windows::WindowsProcessManagerFactory::platform_name();
    }
}

/// Process manager type for the compilation target
pub type PlatformProcessManager = <PlatformProcessManagerFactory as ProcessManagerFactory>::Manager;

/// Process handle type produced by [`PlatformProcessManager`]
pub type PlatformProcessHandle =
    <PlatformProcessManager as embedded_influx_core::ProcessLifecycle>::Handle;
