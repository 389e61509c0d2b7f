use anyhow::{Context, Result};
use std::fs;
use std::process;
use std::sync::Arc;
use tokengate::{
    cli::{Cli, Commands},
    config::AuthConfig,
    logging, ClientType, Identity, TokenManager,
};

#[tokio::main]
async fn main() -> Result<()> {
    // 加载 .env 文件（如果存在）
    let _ = dotenvy::dotenv();

    // 解析命令行参数
    let cli = Cli::parse();

    // 不依赖完整配置的子命令
    match &cli.command {
        Some(Commands::GenerateConfig { path }) => return generate_config(path),
        Some(Commands::ValidateConfig { path }) => return validate_config(path),
        _ => {}
    }

    // 加载配置（按优先级：命令行 > 环境变量 > 配置文件 > 默认值）
    let config = AuthConfig::load(&cli).context("加载配置失败")?;

    if let Some(Commands::ShowConfig) = &cli.command {
        return show_config(&config);
    }

    let _guard = logging::init_logging(
        &config.logging.level,
        config.logging.format.as_deref(),
        config.logging.file.as_deref(),
        cli.quiet,
    )?;

    if cli.dev {
        tracing::info!("🔧 开发模式已启用");
    }

    let manager = match TokenManager::connect(&config).await {
        Ok(manager) => Arc::new(manager),
        Err(e) => {
            tracing::error!("❌ 初始化失败: {}", e);
            tracing::error!("💡 请检查签名密钥与 Redis 连接配置后重试");
            process::exit(1);
        }
    };

    match cli.command {
        Some(Commands::Cleanup) => {
            let report = manager.cleanup_expired().await?;
            print_json(&report)
        }
        Some(Commands::Issue {
            user_id,
            username,
            display_name,
            roles,
            permissions,
            client_type,
            device_id,
        }) => {
            let mut identity = Identity::new(user_id, username);
            if let Some(display_name) = display_name {
                identity = identity.with_display_name(display_name);
            }
            identity.roles.extend(roles);
            identity.permissions.extend(permissions);

            let pair = manager
                .issue(
                    &identity,
                    &ClientType::from(client_type.as_str()),
                    device_id.as_deref(),
                )
                .await?;
            print_json(&pair)
        }
        Some(Commands::Verify { token }) => {
            let result = manager.verify(&token).await?;
            print_json(&result)
        }
        Some(Commands::Refresh { token }) => match manager.refresh(&token).await {
            Ok(pair) => print_json(&pair),
            Err(e) => {
                print_json(&e.error_info())?;
                process::exit(1);
            }
        },
        Some(Commands::Revoke { token }) => {
            let revoked = manager.logout(&token).await?;
            println!("✅ 注销完成: {}", revoked);
            Ok(())
        }
        Some(Commands::RevokeAll { user_id }) => {
            let count = manager.logout_all(user_id).await?;
            println!("✅ 已注销用户 {} 的 {} 个会话", user_id, count);
            Ok(())
        }
        Some(Commands::GenerateConfig { .. })
        | Some(Commands::ValidateConfig { .. })
        | Some(Commands::ShowConfig) => Ok(()),
        None => run_cleanup_service(manager).await,
    }
}

/// 默认模式：运行周期清理任务直到 Ctrl-C
async fn run_cleanup_service(manager: Arc<TokenManager>) -> Result<()> {
    tracing::info!("🚀 TokenGate cleanup service starting...");
    tracing::info!("📊 Configuration:");
    tracing::info!("  - Issuer: {}", manager.config().token.issuer);
    tracing::info!("  - Key Prefix: {}", manager.config().store.key_prefix);
    tracing::info!("  - Redis: {}", manager.config().store.redis.is_some());
    tracing::info!(
        "  - Cleanup: enabled={}, interval={}s, batch_size={}",
        manager.config().cleanup.enabled,
        manager.config().cleanup.interval_secs,
        manager.config().cleanup.batch_size
    );

    let handle = manager.start_cleanup();

    tokio::signal::ctrl_c()
        .await
        .context("无法监听 Ctrl-C 信号")?;
    tracing::info!("🛑 收到退出信号，正在关闭...");

    let worker = manager.cleanup_worker();
    worker.stop();
    if let Some(handle) = handle {
        handle.await.context("清理任务异常退出")?;
    }

    tracing::info!("👋 TokenGate 已停止");
    Ok(())
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// 生成默认配置文件
fn generate_config(path: &str) -> Result<()> {
    let default_config = r#"# TokenGate 配置文件
# 此文件由 tokengate generate-config 生成

[token]
# HMAC-SHA512 签名密钥，至少 64 字节（也可通过 TOKENGATE_SECRET 设置）
secret = ""
issuer = "tokengate"
audience = ["tokengate-client", "tokengate-web", "tokengate-app"]
access_ttl_secs = 86400
web_access_ttl_secs = 7200
app_access_ttl_secs = 86400
mini_access_ttl_secs = 86400
refresh_ttl_secs = 604800
clock_skew_secs = 0
expiring_soon_threshold_secs = 300
revoke_family_on_reuse = true
refresh_reuse_grace_secs = 5

[store]
key_prefix = "auth:"

# [store.redis]
# url = "redis://127.0.0.1:6379"
# pool_size = 10
# min_idle = 1
# connection_timeout_secs = 5
# idle_timeout_secs = 300
# command_timeout_ms = 1000

[cleanup]
enabled = true
interval_secs = 300
batch_size = 1000

[logging]
level = "info"
format = "compact"
# file = "./logs/tokengate.log"
"#;

    fs::write(path, default_config).with_context(|| format!("无法写入配置文件: {}", path))?;

    println!("✅ 配置文件已生成: {}", path);
    Ok(())
}

/// 验证配置文件
fn validate_config(path: &str) -> Result<()> {
    let mut config = AuthConfig::from_toml_file(path)
        .with_context(|| format!("配置文件验证失败: {}", path))?;
    config.merge_from_env()?;
    config
        .validate()
        .with_context(|| format!("配置校验失败: {}", path))?;

    println!("✅ 配置文件有效: {}", path);
    println!("📊 配置摘要:");
    println!("  - Issuer: {}", config.token.issuer);
    println!("  - Audience: {:?}", config.token.audience);
    println!("  - Web/App/Mini Access TTL: {}s / {}s / {}s",
        config.token.web_access_ttl_secs,
        config.token.app_access_ttl_secs,
        config.token.mini_access_ttl_secs
    );
    println!("  - Refresh TTL: {}s", config.token.refresh_ttl_secs);
    println!("  - Redis: {}", config.store.redis.is_some());

    Ok(())
}

/// 显示最终配置
fn show_config(config: &AuthConfig) -> Result<()> {
    let content = toml::to_string_pretty(&config.redacted()).context("配置序列化失败")?;
    println!("📋 当前配置（密钥已脱敏）:\n");
    println!("{}", content);
    Ok(())
}
