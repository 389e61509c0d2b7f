use clap::{Parser, Subcommand};

impl Cli {
    /// 解析命令行参数
    pub fn parse() -> Self {
        <Self as Parser>::parse()
    }
}

/// TokenGate - 分布式令牌生命周期管理
#[derive(Parser, Debug, Default)]
#[command(name = "tokengate")]
#[command(version)]
#[command(about = "令牌签发、验证、轮换、撤销与多设备会话管理", long_about = None)]
pub struct Cli {
    /// 配置文件路径
    #[arg(long, value_name = "FILE", help = "指定配置文件路径")]
    pub config_file: Option<String>,

    /// Redis 连接 URL
    #[arg(long, value_name = "URL", help = "Redis 连接字符串")]
    pub redis_url: Option<String>,

    /// 签名密钥
    #[arg(long, value_name = "SECRET", help = "HMAC 签名密钥（至少 64 字节）")]
    pub secret: Option<String>,

    /// 签发者
    #[arg(long, value_name = "NAME", help = "令牌签发者")]
    pub issuer: Option<String>,

    /// Key 前缀
    #[arg(long, value_name = "PREFIX", help = "存储 key 命名空间前缀")]
    pub key_prefix: Option<String>,

    /// 日志级别
    #[arg(
        long,
        value_name = "LEVEL",
        help = "日志级别: trace, debug, info, warn, error"
    )]
    pub log_level: Option<String>,

    /// 日志格式
    #[arg(long, value_name = "FORMAT", help = "日志格式: pretty, json, compact")]
    pub log_format: Option<String>,

    /// 日志文件路径
    #[arg(long, value_name = "PATH", help = "日志输出文件路径")]
    pub log_file: Option<String>,

    /// 详细输出（可重复使用：-v, -vv, -vvv）
    #[arg(short, action = clap::ArgAction::Count, help = "详细输出级别")]
    pub verbose: u8,

    /// 静默模式
    #[arg(long, short = 'q', help = "静默模式（不输出日志）")]
    pub quiet: bool,

    /// 开发模式（等同于 --log-level debug --log-format pretty）
    #[arg(long, help = "启用开发模式")]
    pub dev: bool,

    /// 子命令
    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// 生成默认配置文件
    GenerateConfig {
        /// 输出文件路径
        #[arg(value_name = "PATH", default_value = "tokengate.toml")]
        path: String,
    },
    /// 验证配置文件
    ValidateConfig {
        /// 配置文件路径
        #[arg(value_name = "PATH", default_value = "tokengate.toml")]
        path: String,
    },
    /// 显示最终配置（合并后的配置，密钥脱敏）
    ShowConfig,
    /// 执行一次过期索引清理
    Cleanup,
    /// 为用户签发令牌对
    Issue {
        #[arg(long)]
        user_id: u64,
        #[arg(long)]
        username: String,
        #[arg(long)]
        display_name: Option<String>,
        #[arg(long = "role")]
        roles: Vec<String>,
        #[arg(long = "permission")]
        permissions: Vec<String>,
        #[arg(long, default_value = "web")]
        client_type: String,
        #[arg(long)]
        device_id: Option<String>,
    },
    /// 验证访问令牌
    Verify {
        #[arg(value_name = "TOKEN")]
        token: String,
    },
    /// 使用刷新令牌轮换令牌对
    Refresh {
        #[arg(value_name = "REFRESH_TOKEN")]
        token: String,
    },
    /// 注销单个访问令牌
    Revoke {
        #[arg(value_name = "TOKEN")]
        token: String,
    },
    /// 注销用户的全部会话
    RevokeAll {
        #[arg(value_name = "USER_ID")]
        user_id: u64,
    },
}

impl Cli {
    /// 获取日志级别（考虑 verbose 和 quiet）
    pub fn get_log_level(&self) -> Option<String> {
        if self.quiet {
            return Some("error".to_string());
        }

        if self.dev {
            return Some("debug".to_string());
        }

        if let Some(level) = &self.log_level {
            return Some(level.clone());
        }

        match self.verbose {
            0 => None,
            1 => Some("info".to_string()),
            2 => Some("debug".to_string()),
            _ => Some("trace".to_string()),
        }
    }

    /// 获取日志格式
    pub fn get_log_format(&self) -> Option<String> {
        if self.dev {
            return Some("pretty".to_string());
        }
        self.log_format.clone()
    }
}
