use std::collections::HashMap;

pub struct I18n {
    translations: HashMap<String, HashMap<String, String>>,
    current_lang: String,
}

fn table(entries: &[(&str, &str)]) -> HashMap<String, String> {
    entries
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

impl I18n {
    pub fn new(lang: &str) -> Self {
        let mut translations = HashMap::new();

        // English
        let en = table(&[
            ("execution_started", "Execution {0} started"),
            ("execution_waiting", "Waiting for it to finish (Ctrl+C stops waiting; the command keeps running and its result is still recorded)..."),
            ("execution_detached", "Check on it with: cmdhub show {0}"),
            ("execution_vanished", "Execution {0} was removed before it finished"),
            ("execution_not_found", "Execution {0} not found"),
            ("execution_deleted", "Execution {0} deleted"),
            // Record fields
            ("label_id", "ID"),
            ("label_status", "Status"),
            ("label_name", "Name"),
            ("label_command", "Command"),
            ("label_workdir", "Workdir"),
            ("label_executed_by", "Executed by"),
            ("label_started", "Started"),
            ("label_ended", "Ended"),
            ("label_duration", "Duration"),
            ("label_exit_code", "Exit code"),
            ("label_output", "Output:"),
            ("label_description", "Description"),
            ("label_tags", "Tags"),
            ("label_created", "Created"),
            ("label_updated", "Updated"),
            ("no_output", "(no output)"),
            // Listing
            ("no_records", "No executions recorded"),
            ("showing_recent", "(showing {0} of {1} executions, use --all to see everything)"),
            // Clear
            ("confirm_clear_title", "This deletes all {0} execution records."),
            ("confirm_delete_prompt", "Type 'yes' to continue: "),
            ("confirm_aborted", "Aborted"),
            ("cleared_all", "All executions cleared"),
            // Saved commands
            ("template_created", "Saved command {0} created"),
            ("template_updated", "Saved command {0} updated"),
            ("template_removed", "Saved command {0} removed"),
            ("no_templates", "No saved commands"),
        ]);
        translations.insert("en".to_string(), en);

        // 中文
        let zh = table(&[
            ("execution_started", "执行 {0} 已启动"),
            ("execution_waiting", "等待执行完成（Ctrl+C 只停止等待，命令会继续运行并记录结果）..."),
            ("execution_detached", "查看进度: cmdhub show {0}"),
            ("execution_vanished", "执行 {0} 在完成前已被删除"),
            ("execution_not_found", "未找到执行记录 {0}"),
            ("execution_deleted", "执行记录 {0} 已删除"),
            ("label_id", "ID"),
            ("label_status", "状态"),
            ("label_name", "名称"),
            ("label_command", "命令"),
            ("label_workdir", "工作目录"),
            ("label_executed_by", "执行者"),
            ("label_started", "开始时间"),
            ("label_ended", "结束时间"),
            ("label_duration", "耗时"),
            ("label_exit_code", "退出码"),
            ("label_output", "输出:"),
            ("label_description", "描述"),
            ("label_tags", "标签"),
            ("label_created", "创建时间"),
            ("label_updated", "更新时间"),
            ("no_output", "（无输出）"),
            ("no_records", "暂无执行记录"),
            ("showing_recent", "（显示 {0}/{1} 条记录，使用 --all 查看全部）"),
            ("confirm_clear_title", "将删除全部 {0} 条执行记录。"),
            ("confirm_delete_prompt", "输入 'yes' 继续: "),
            ("confirm_aborted", "已取消"),
            ("cleared_all", "已清空所有执行记录"),
            ("template_created", "已创建保存的命令 {0}"),
            ("template_updated", "已更新保存的命令 {0}"),
            ("template_removed", "已删除保存的命令 {0}"),
            ("no_templates", "暂无保存的命令"),
        ]);
        translations.insert("zh".to_string(), zh);

        // 确定语言 - 支持多种语言代码格式
        let effective_lang = if lang.starts_with("zh") || lang == "cn" || lang == "chinese" {
            "zh"
        } else {
            "en"
        };

        Self {
            translations,
            current_lang: effective_lang.to_string(),
        }
    }

    pub fn t(&self, key: &str) -> String {
        if let Some(lang_map) = self.translations.get(&self.current_lang) {
            if let Some(value) = lang_map.get(key) {
                return value.clone();
            }
        }
        key.to_string()
    }

    pub fn t_format(&self, key: &str, args: &[&str]) -> String {
        let template = self.t(key);
        let mut result = template;
        for (i, arg) in args.iter().enumerate() {
            result = result.replace(&format!("{{{}}}", i), arg);
        }
        result
    }
}
