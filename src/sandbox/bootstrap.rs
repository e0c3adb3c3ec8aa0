//! First-boot script executed as a sandbox's main process.

use std::path::{Path, PathBuf};

use crate::error::Result;

/// File name of the host copy of the script, inside the user's data directory.
pub const SCRIPT_NAME: &str = "setup_container.sh";

/// Path of the script inside the container.
pub const CONTAINER_SCRIPT: &str = "/startup.sh";

/// Inputs for rendering the first-boot script.
#[derive(Debug, Clone)]
pub struct Bootstrap<'a> {
    pub safe_name: &'a str,
    pub password: &'a str,
    /// Mount point of the shared toolchain, linked into the user's home.
    pub toolchain_mount: Option<&'a str>,
}

impl Bootstrap<'_> {
    /// Renders the script.
    ///
    /// Every step is idempotent so a container restart reruns it safely. The
    /// last step execs the session daemon, which keeps the container alive.
    pub fn render(&self) -> String {
        let user = self.safe_name;
        let mut script = format!(
            r#"#!/bin/bash
USER="{user}"

(
    if ! python3 -c "import serial" &>/dev/null; then
        apt-get update -y &>/dev/null
        apt-get install -y python3-serial python3-pip &>/dev/null
        pip3 install pyserial esptool --break-system-packages &>/dev/null || pip3 install pyserial esptool &>/dev/null
    fi
) &

if ! id "$USER" &>/dev/null; then
    useradd -m -s /bin/bash "$USER"
fi
echo "$USER:{password}" | chpasswd
usermod -aG dialout "$USER" || true

cat > /home/"$USER"/.bashrc << 'EOF_BASHRC'
case $- in *i*) ;; *) return;; esac
export PATH="/usr/local/bin:$PATH"
alias ll='ls -alF'
if [ -f ~/WELCOME.txt ]; then cat ~/WELCOME.txt; fi
EOF_BASHRC

cat > /home/"$USER"/WELCOME.txt << EOF
================================================================
 devbench workspace for $USER
 Supported hardware: ESP32, ESP8266, Arduino
================================================================
EOF

mkdir -p /home/"$USER"/Arduino/libraries
cp -rn /root/Arduino/libraries/* /home/"$USER"/Arduino/libraries/ 2>/dev/null || true
"#,
            user = user,
            password = self.password,
        );

        if let Some(mount) = self.toolchain_mount {
            script.push_str(&format!(
                "ln -sfn {mount} /home/\"$USER\"/.arduino15 2>/dev/null || true\n",
                mount = mount
            ));
        }

        script.push_str(
            r#"
chown -R "$USER:$USER" /home/"$USER"
chmod 666 /dev/ttyUSB* /dev/ttyACM* 2>/dev/null || true

mkdir -p /run/sshd
grep -q '^ClientAliveInterval' /etc/ssh/sshd_config || cat >> /etc/ssh/sshd_config << 'EOF_SSHD'
ClientAliveInterval 30
ClientAliveCountMax 100
TCPKeepAlive yes
EOF_SSHD

exec /usr/sbin/sshd -D
"#,
        );
        script
    }

    /// Writes the script into `data_dir` and returns its host path.
    pub async fn write_to(&self, data_dir: &Path) -> Result<PathBuf> {
        let path = data_dir.join(SCRIPT_NAME);
        // A stray directory at the script path would be mounted instead of the file.
        if tokio::fs::metadata(&path).await.is_ok_and(|m| m.is_dir()) {
            tokio::fs::remove_dir_all(&path).await?;
        }
        tokio::fs::write(&path, self.render()).await?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            tokio::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).await?;
        }

        Ok(path)
    }
}
