//! Command lines for the rootless podman install that `setup` leaves in
//! each node's home directory.

/// Directory, relative to the home directory, that the podman-static
/// tarball unpacks into.
pub const PODMAN_BIN_DIR: &str = "podman-bin";

const PODMAN_ROOT: &str = "podman-bin/podman-linux-amd64";

/// Prefix that runs the bundled podman binary with its helpers on `PATH`.
pub fn podman_cmd(home_dir: &str) -> String {
    let additional_path = format!(
        "{home}/{root}/usr/local/lib/podman:{home}/{root}/usr/local/bin",
        home = home_dir,
        root = PODMAN_ROOT,
    );
    format!(
        "PATH=$PATH:{} CONTAINERS_CONF={}/.config/containers/containers.conf sudo -E ~/{}/usr/local/bin/podman",
        additional_path, home_dir, PODMAN_ROOT
    )
}

/// Local tag a provisioned image is known by on every node.
pub fn image_ref(image_name: &str) -> String {
    format!("{0}:{0}", image_name)
}

/// Run `command` inside a throwaway container of the provisioned image.
pub fn wrap_command(home_dir: &str, image_name: &str, command: &str) -> String {
    format!(
        "{} run --rm {} {}",
        podman_cmd(home_dir),
        image_ref(image_name),
        command
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn podman_cmd_points_into_home() {
        let cmd = podman_cmd("/home/u");
        assert_eq!(
            cmd,
            "PATH=$PATH:/home/u/podman-bin/podman-linux-amd64/usr/local/lib/podman:\
             /home/u/podman-bin/podman-linux-amd64/usr/local/bin \
             CONTAINERS_CONF=/home/u/.config/containers/containers.conf \
             sudo -E ~/podman-bin/podman-linux-amd64/usr/local/bin/podman"
        );
    }

    #[test]
    fn wrap_uses_image_tag() {
        let cmd = wrap_command("/root", "task-7", "echo hi");
        assert!(cmd.starts_with("PATH=$PATH:/root/"));
        assert!(cmd.ends_with(" run --rm task-7:task-7 echo hi"));
    }
}
