//! Reconciles the configured service list with the persisted `services`
//! table (§4.C of the spec): every service named in the config file is
//! upserted, and every persisted service no longer named in the config file
//! is deleted, cascading its deployment history.

use tracing::info;

use crate::persistence::{Persistence, ServiceDef};

pub async fn reconcile(db: &Persistence, configured: &[ServiceDef]) -> Result<(), sqlx::Error> {
    let persisted = db.list_services().await?;

    for def in configured {
        let existed = persisted.iter().any(|s| s.name == def.name);
        db.upsert_service(def).await?;
        if existed {
            info!(service = %def.name, "reconciled existing service");
        } else {
            info!(service = %def.name, "registered new service");
        }
    }

    for service in &persisted {
        if !configured.iter().any(|def| def.name == service.name) {
            info!(service = %service.name, "removing service no longer in configuration");
            db.delete_service_cascade(service.id).await?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn def(name: &str) -> ServiceDef {
        ServiceDef {
            name: name.into(),
            repository: "alice/site".into(),
            path: "/tmp/site".into(),
            branch: "main".into(),
            deploy_command: "echo hi".into(),
        }
    }

    #[tokio::test]
    async fn adds_updates_and_removes() {
        let db = Persistence::new_in_memory().await;

        reconcile(&db, &[def("web"), def("worker")]).await.unwrap();
        let services = db.list_services().await.unwrap();
        assert_eq!(services.len(), 2);

        reconcile(&db, &[def("web")]).await.unwrap();
        let services = db.list_services().await.unwrap();
        assert_eq!(services.len(), 1);
        assert_eq!(services[0].name, "web");
    }
}
