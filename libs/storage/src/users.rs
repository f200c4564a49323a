//! Users, roles, permissions, teams. Role/permission associations are plain
//! join rows; nothing here holds an object graph.

use omc_core::Result;
use sqlx::FromRow;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::{db_err, Store, Team, User};

/// Load snapshot used by the load-balanced assignment strategy.
#[derive(Debug, Clone, FromRow)]
pub struct AgentLoad {
    pub agent_id: Uuid,
    pub active: i64,
    pub last_assigned_at: Option<OffsetDateTime>,
}

impl Store {
    /// Tenant-scoped user lookup. A miss (including a row that exists under
    /// another tenant) is simply `None`; callers surface `NotFound`.
    pub async fn user_scoped(&self, org_id: Uuid, user_id: Uuid) -> Result<Option<User>> {
        sqlx::query_as(
            r#"
            SELECT id, organization_id, email, name, role_id, is_super_admin,
                   is_active, availability, break_started_at
            FROM users WHERE organization_id = $1 AND id = $2
            "#,
        )
        .bind(org_id)
        .bind(user_id)
        .fetch_optional(self.pool())
        .await
        .map_err(db_err)
    }

    /// Unscoped lookup used only to establish identity before a tenant is
    /// known (super-admin impersonation resolves through this).
    pub async fn user_by_id(&self, user_id: Uuid) -> Result<Option<User>> {
        sqlx::query_as(
            r#"
            SELECT id, organization_id, email, name, role_id, is_super_admin,
                   is_active, availability, break_started_at
            FROM users WHERE id = $1
            "#,
        )
        .bind(user_id)
        .fetch_optional(self.pool())
        .await
        .map_err(db_err)
    }

    /// The role's permission set as `"resource:action"` strings.
    pub async fn permission_strings_for_role(&self, role_id: Uuid) -> Result<Vec<String>> {
        let rows: Vec<(String,)> = sqlx::query_as(
            r#"
            SELECT p.resource || ':' || p.action
            FROM role_permissions rp
            JOIN permissions p ON p.id = rp.permission_id
            WHERE rp.role_id = $1
            "#,
        )
        .bind(role_id)
        .fetch_all(self.pool())
        .await
        .map_err(db_err)?;
        Ok(rows.into_iter().map(|(s,)| s).collect())
    }

    pub async fn set_availability(
        &self,
        org_id: Uuid,
        user_id: Uuid,
        availability: &str,
        break_started_at: Option<OffsetDateTime>,
    ) -> Result<Option<User>> {
        sqlx::query_as(
            r#"
            UPDATE users SET availability = $3, break_started_at = $4
            WHERE organization_id = $1 AND id = $2
            RETURNING id, organization_id, email, name, role_id, is_super_admin,
                      is_active, availability, break_started_at
            "#,
        )
        .bind(org_id)
        .bind(user_id)
        .bind(availability)
        .bind(break_started_at)
        .fetch_optional(self.pool())
        .await
        .map_err(db_err)
    }

    pub async fn team_scoped(&self, org_id: Uuid, team_id: Uuid) -> Result<Option<Team>> {
        sqlx::query_as("SELECT * FROM teams WHERE organization_id = $1 AND id = $2")
            .bind(org_id)
            .bind(team_id)
            .fetch_optional(self.pool())
            .await
            .map_err(db_err)
    }

    /// Agents of a team eligible for auto-assignment: active, available, and
    /// holding the given permission through their role.
    pub async fn available_team_agents(
        &self,
        org_id: Uuid,
        team_id: Uuid,
        resource: &str,
        action: &str,
    ) -> Result<Vec<User>> {
        sqlx::query_as(
            r#"
            SELECT u.id, u.organization_id, u.email, u.name, u.role_id, u.is_super_admin,
                   u.is_active, u.availability, u.break_started_at
            FROM users u
            JOIN team_members tm ON tm.user_id = u.id
            WHERE tm.team_id = $1
              AND u.organization_id = $2
              AND u.is_active
              AND u.availability = 'available'
              AND (u.is_super_admin OR EXISTS (
                  SELECT 1 FROM role_permissions rp
                  JOIN permissions p ON p.id = rp.permission_id
                  WHERE rp.role_id = u.role_id AND p.resource = $3 AND p.action = $4))
            ORDER BY u.created_at ASC
            "#,
        )
        .bind(team_id)
        .bind(org_id)
        .bind(resource)
        .bind(action)
        .fetch_all(self.pool())
        .await
        .map_err(db_err)
    }

    /// Advances the team's round-robin cursor and returns the new value.
    pub async fn advance_rr_cursor(&self, team_id: Uuid) -> Result<i32> {
        let (cursor,): (i32,) = sqlx::query_as(
            "UPDATE teams SET rr_cursor = rr_cursor + 1 WHERE id = $1 RETURNING rr_cursor",
        )
        .bind(team_id)
        .fetch_one(self.pool())
        .await
        .map_err(db_err)?;
        Ok(cursor)
    }

    /// Active-transfer load per agent, for the load-balanced strategy.
    pub async fn agent_loads(&self, org_id: Uuid, agent_ids: &[Uuid]) -> Result<Vec<AgentLoad>> {
        sqlx::query_as(
            r#"
            SELECT u.id AS agent_id,
                   COUNT(t.id) AS active,
                   MAX(t.assigned_at) AS last_assigned_at
            FROM users u
            LEFT JOIN agent_transfers t
                ON t.agent_id = u.id AND t.status = 'assigned' AND t.organization_id = $1
            WHERE u.id = ANY($2)
            GROUP BY u.id
            "#,
        )
        .bind(org_id)
        .bind(agent_ids)
        .fetch_all(self.pool())
        .await
        .map_err(db_err)
    }
}
